//! Classic interval retargeting.

use consensus_core::compact::compact_to_target;
use consensus_core::errors::VerificationError;
use consensus_core::{BlockHeader, Network, NetworkParams, StoredBlock};
use primitive_types::U256;
use tracing::info;

use crate::chain::ChainBackend;
use crate::error::ChainError;

/// 15th February 2012, when the testnet min-difficulty rule activated.
const TESTNET_DIFF_DATE: u64 = 1_329_264_000;

pub(super) fn check(
    stored_prev: &StoredBlock,
    next: &BlockHeader,
    params: &NetworkParams,
    backend: &dyn ChainBackend,
) -> Result<(), ChainError> {
    let prev = stored_prev.header();
    let height = stored_prev.height() + 1;

    // Is this supposed to be a difficulty transition point?
    if height % params.interval != 0 {
        if params.network == Network::Testnet && next.timestamp > TESTNET_DIFF_DATE {
            return check_testnet_difficulty(stored_prev, prev, next, params, backend);
        }

        // No ... so check the difficulty didn't actually change.
        if next.bits != prev.bits {
            return Err(VerificationError::UnexpectedDifficultyChange {
                height: stored_prev.height(),
                received: next.bits,
                expected: prev.bits,
            }
            .into());
        }
        return Ok(());
    }

    // Walk back to the start of the interval. The very first retarget
    // walks one block less, reproducing the network's historical
    // off-by-one.
    let blocks_to_go_back =
        if height != params.interval { params.interval } else { params.interval - 1 };

    let mut cursor = Some(*stored_prev);
    for _ in 0..blocks_to_go_back {
        let current = cursor.ok_or(VerificationError::BrokenRetargetWalk)?;
        cursor = backend.get(&current.header().prev_block_hash)?;
    }
    let interval_ago = cursor.ok_or(VerificationError::BrokenRetargetWalk)?;

    let mut timespan = prev.timestamp as i64 - interval_ago.header().timestamp as i64;
    // Limit the adjustment step.
    let target_timespan = params.target_timespan as i64;
    if timespan < target_timespan / 4 {
        timespan = target_timespan / 4;
    }
    if timespan > target_timespan * 4 {
        timespan = target_timespan * 4;
    }

    let mut new_target = compact_to_target(prev.bits);
    new_target = new_target * U256::from(timespan as u64);
    new_target = new_target / U256::from(target_timespan as u64);

    if new_target > params.pow_limit() {
        info!("difficulty hit proof of work limit: {:x}", new_target);
        new_target = params.pow_limit();
    }

    let accuracy_bytes = ((next.bits >> 24) as usize).saturating_sub(3);
    let received = next.target();

    // The calculated difficulty is to a higher precision than received,
    // so reduce here.
    let mask = U256::from(0x00ff_ffffu64) << (accuracy_bytes * 8);
    new_target = new_target & mask;

    if new_target != received {
        return Err(VerificationError::DifficultyMismatch { received, calculated: new_target }.into());
    }
    Ok(())
}

/// After 15th February 2012 the testnet rules allow a min-difficulty
/// block whenever 2× the target spacing passed without one; otherwise
/// the difficulty must equal that of the last non-min-difficulty block.
fn check_testnet_difficulty(
    stored_prev: &StoredBlock,
    prev: &BlockHeader,
    next: &BlockHeader,
    params: &NetworkParams,
    backend: &dyn ChainBackend,
) -> Result<(), ChainError> {
    let time_delta = next.timestamp as i64 - prev.timestamp as i64;
    // There is an integer underflow bug in the reference client that
    // means min-difficulty blocks are accepted when time goes backwards.
    if time_delta >= 0 && time_delta <= (params.target_spacing * 2) as i64 {
        // Walk backwards until we find a block that doesn't have the
        // easiest proof of work, then check that difficulty is equal to
        // that one.
        let genesis_hash = params.genesis_hash();
        let mut cursor = *stored_prev;
        while cursor.hash() != genesis_hash
            && cursor.height() % params.interval != 0
            && cursor.header().target() == params.pow_limit()
        {
            cursor = backend
                .get(&cursor.header().prev_block_hash)?
                .ok_or(VerificationError::BrokenRetargetWalk)?;
        }
        if cursor.header().target() != next.target() {
            return Err(VerificationError::TestnetDifficulty(cursor.header().bits, next.bits).into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::HeaderOnlyBackend;
    use crate::store::{BlockStore, MemoryBlockStore};
    use consensus_core::compact::target_to_compact;
    use consensus_core::ZERO_HASH;
    use std::sync::Arc;

    struct Fixture {
        params: NetworkParams,
        store: Arc<MemoryBlockStore>,
        backend: HeaderOnlyBackend,
    }

    impl Fixture {
        fn new(mut params: NetworkParams) -> Self {
            // Short interval keeps retarget tests tractable.
            params.interval = 8;
            params.target_timespan = 8 * params.target_spacing;
            let store = Arc::new(MemoryBlockStore::new(&params));
            let backend = HeaderOnlyBackend::new(store.clone());
            Self { params, store, backend }
        }

        fn extend(&self, parent: &StoredBlock, bits: u32, timestamp: u64) -> StoredBlock {
            let header = BlockHeader::new(1, parent.hash(), ZERO_HASH, timestamp, bits, parent.height() + 1);
            let stored = parent.build(header);
            self.store.put(&stored).unwrap();
            stored
        }

        fn genesis(&self) -> StoredBlock {
            self.store.get_chain_head().unwrap()
        }
    }

    #[test]
    fn mainnet_off_interval_requires_unchanged_bits() {
        let fx = Fixture::new(NetworkParams::mainnet());
        let genesis = fx.genesis();
        let b1 = fx.extend(&genesis, fx.params.pow_limit_bits, fx.params.genesis.timestamp + 150);

        let good = BlockHeader::new(1, b1.hash(), ZERO_HASH, b1.header().timestamp + 150, fx.params.pow_limit_bits, 0);
        check(&b1, &good, &fx.params, &fx.backend).unwrap();

        let bad = BlockHeader::new(1, b1.hash(), ZERO_HASH, b1.header().timestamp + 150, 0x1d00ffff, 0);
        assert!(matches!(
            check(&b1, &bad, &fx.params, &fx.backend),
            Err(ChainError::Invalid(VerificationError::UnexpectedDifficultyChange { .. }))
        ));
    }

    #[test]
    fn mainnet_retarget_scales_with_elapsed_time() {
        let fx = Fixture::new(NetworkParams::mainnet());
        let spacing = fx.params.target_spacing;
        let start = fx.params.genesis.timestamp;
        // Choose a previous difficulty well inside the pow limit so the
        // retarget result is not clamped.
        let prev_bits = 0x1c0ffff0;

        // Blocks came twice as fast as intended.
        let mut tip = fx.genesis();
        for i in 1..8u64 {
            tip = fx.extend(&tip, prev_bits, start + i * spacing / 2);
        }
        assert_eq!(tip.height() + 1, fx.params.interval);

        // First retarget walks interval-1 back, landing on genesis.
        let elapsed = tip.header().timestamp as i64 - fx.params.genesis.timestamp as i64;
        let expected = compact_to_target(prev_bits) * U256::from(elapsed as u64)
            / U256::from(fx.params.target_timespan);
        let expected_bits = target_to_compact(expected);

        let good = BlockHeader::new(1, tip.hash(), ZERO_HASH, tip.header().timestamp + 150, expected_bits, 0);
        check(&tip, &good, &fx.params, &fx.backend).unwrap();

        // Claiming the difficulty stayed put is rejected.
        let lazy = BlockHeader::new(1, tip.hash(), ZERO_HASH, tip.header().timestamp + 150, prev_bits, 0);
        assert!(matches!(
            check(&tip, &lazy, &fx.params, &fx.backend),
            Err(ChainError::Invalid(VerificationError::DifficultyMismatch { .. }))
        ));
    }

    #[test]
    fn retarget_clamps_the_adjustment_step() {
        let fx = Fixture::new(NetworkParams::mainnet());
        let start = fx.params.genesis.timestamp;
        let prev_bits = 0x1c0ffff0;

        // All seven blocks share one timestamp: elapsed time zero,
        // clamped up to timespan/4.
        let mut tip = fx.genesis();
        for _ in 1..8u64 {
            tip = fx.extend(&tip, prev_bits, start);
        }

        let expected = compact_to_target(prev_bits) / U256::from(4u64);
        let expected_bits = target_to_compact(expected);
        let good = BlockHeader::new(1, tip.hash(), ZERO_HASH, start + 150, expected_bits, 0);
        check(&tip, &good, &fx.params, &fx.backend).unwrap();
    }

    #[test]
    fn testnet_allows_min_difficulty_after_a_gap() {
        let fx = Fixture::new(NetworkParams::testnet());
        let genesis = fx.genesis();
        let start = fx.params.genesis.timestamp;
        let b1 = fx.extend(&genesis, 0x1c0ffff0, start + 150);

        // More than 2x spacing without a block: the easiest target is
        // allowed even though b1 is harder.
        let slow = BlockHeader::new(1, b1.hash(), ZERO_HASH, b1.header().timestamp + 301, fx.params.pow_limit_bits, 0);
        check(&b1, &slow, &fx.params, &fx.backend).unwrap();

        // Within the window the last non-minimum difficulty governs.
        let fast = BlockHeader::new(1, b1.hash(), ZERO_HASH, b1.header().timestamp + 150, fx.params.pow_limit_bits, 0);
        assert!(matches!(
            check(&b1, &fast, &fx.params, &fx.backend),
            Err(ChainError::Invalid(VerificationError::TestnetDifficulty(..)))
        ));

        let matching = BlockHeader::new(1, b1.hash(), ZERO_HASH, b1.header().timestamp + 150, 0x1c0ffff0, 0);
        check(&b1, &matching, &fx.params, &fx.backend).unwrap();
    }
}
