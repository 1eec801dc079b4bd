//! Dark Gravity Wave, first and third revisions.
//!
//! Both walk a fixed window of recent blocks and retarget an average
//! difficulty by the ratio of elapsed to intended time. The original
//! revision blends a moving average of block gaps with a simple one in
//! floating point; v3 reduces the window to 24 blocks and drops the
//! floating-point blend.

use consensus_core::{BlockHeader, NetworkParams, StoredBlock};
use primitive_types::U256;

use super::{step_average, verify_difficulty};
use crate::chain::ChainBackend;
use crate::error::ChainError;

pub(super) fn check_dgw(
    stored_prev: &StoredBlock,
    next: &BlockHeader,
    params: &NetworkParams,
    backend: &dyn ChainBackend,
) -> Result<(), ChainError> {
    const PAST_BLOCKS_MIN: u64 = 14;
    const PAST_BLOCKS_MAX: u64 = 140;

    if stored_prev.height() == 0 || stored_prev.height() < PAST_BLOCKS_MIN {
        return verify_difficulty(params.pow_limit(), stored_prev, next, params);
    }

    let mut block_reading = *stored_prev;
    let mut block_time_average: i64 = 0;
    let mut block_time_average_prev: i64 = 0;
    let mut block_time_count: u64 = 0;
    let mut block_time_sum2: i64 = 0;
    let mut block_time_count2: u64 = 0;
    let mut last_block_time: i64 = 0;
    let mut count_blocks: u64 = 0;
    let mut past_difficulty_average = U256::zero();
    let mut past_difficulty_average_prev = U256::zero();

    let mut i = 1u64;
    while block_reading.height() > 0 {
        if i > PAST_BLOCKS_MAX {
            break;
        }
        count_blocks += 1;

        if count_blocks <= PAST_BLOCKS_MIN {
            if count_blocks == 1 {
                past_difficulty_average = block_reading.header().target();
            } else {
                past_difficulty_average =
                    step_average(block_reading.header().target(), past_difficulty_average_prev, count_blocks);
            }
            past_difficulty_average_prev = past_difficulty_average;
        }

        if last_block_time > 0 {
            let diff = last_block_time - block_reading.header().timestamp as i64;
            if block_time_count <= PAST_BLOCKS_MIN {
                block_time_count += 1;
                if block_time_count == 1 {
                    block_time_average = diff;
                } else {
                    block_time_average =
                        (diff - block_time_average_prev) / block_time_count as i64 + block_time_average_prev;
                }
                block_time_average_prev = block_time_average;
            }
            block_time_count2 += 1;
            block_time_sum2 += diff;
        }
        last_block_time = block_reading.header().timestamp as i64;

        match backend.get(&block_reading.header().prev_block_hash)? {
            Some(prev) => block_reading = prev,
            None => return Ok(()),
        }
        i += 1;
    }

    let mut bn_new = past_difficulty_average;
    if block_time_count != 0 && block_time_count2 != 0 {
        let mut smart_average =
            block_time_average as f64 * 0.7 + (block_time_sum2 as f64 / block_time_count2 as f64) * 0.3;
        if smart_average < 1.0 {
            smart_average = 1.0;
        }
        let shift = params.target_spacing as f64 / smart_average;

        let mut actual_timespan = (count_blocks as f64 * params.target_spacing as f64) / shift;
        let target_timespan = count_blocks as f64 * params.target_spacing as f64;
        if actual_timespan < target_timespan / 3.0 {
            actual_timespan = target_timespan / 3.0;
        }
        if actual_timespan > target_timespan * 3.0 {
            actual_timespan = target_timespan * 3.0;
        }

        // Retarget.
        bn_new = bn_new * U256::from(actual_timespan as i64 as u64);
        bn_new = bn_new / U256::from(target_timespan as i64 as u64);
    }

    verify_difficulty(bn_new, stored_prev, next, params)
}

pub(super) fn check_dgw3(
    stored_prev: &StoredBlock,
    next: &BlockHeader,
    params: &NetworkParams,
    backend: &dyn ChainBackend,
) -> Result<(), ChainError> {
    const PAST_BLOCKS_MIN: u64 = 24;
    const PAST_BLOCKS_MAX: u64 = 24;

    if stored_prev.height() == 0 || stored_prev.height() < PAST_BLOCKS_MIN {
        return verify_difficulty(params.pow_limit(), stored_prev, next, params);
    }

    let mut block_reading = *stored_prev;
    let mut actual_timespan: i64 = 0;
    let mut last_block_time: i64 = 0;
    let mut count_blocks: u64 = 0;
    let mut past_difficulty_average = U256::zero();
    let mut past_difficulty_average_prev = U256::zero();

    let mut i = 1u64;
    while block_reading.height() > 0 {
        if i > PAST_BLOCKS_MAX {
            break;
        }
        count_blocks += 1;

        if count_blocks <= PAST_BLOCKS_MIN {
            if count_blocks == 1 {
                past_difficulty_average = block_reading.header().target();
            } else {
                // Cumulative moving average over the sampled targets.
                past_difficulty_average = (past_difficulty_average_prev * U256::from(count_blocks)
                    + block_reading.header().target())
                    / U256::from(count_blocks + 1);
            }
            past_difficulty_average_prev = past_difficulty_average;
        }

        if last_block_time > 0 {
            let diff = last_block_time - block_reading.header().timestamp as i64;
            actual_timespan += diff;
        }
        last_block_time = block_reading.header().timestamp as i64;

        match backend.get(&block_reading.header().prev_block_hash)? {
            Some(prev) => block_reading = prev,
            None => return Ok(()),
        }
        i += 1;
    }

    let mut bn_new = past_difficulty_average;

    let target_timespan = (count_blocks * params.target_spacing) as i64;
    if actual_timespan < target_timespan / 3 {
        actual_timespan = target_timespan / 3;
    }
    if actual_timespan > target_timespan * 3 {
        actual_timespan = target_timespan * 3;
    }

    // Retarget.
    bn_new = bn_new * U256::from(actual_timespan as u64);
    bn_new = bn_new / U256::from(target_timespan as u64);

    verify_difficulty(bn_new, stored_prev, next, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::HeaderOnlyBackend;
    use crate::store::{BlockStore, MemoryBlockStore};
    use consensus_core::compact::target_to_compact;
    use consensus_core::{NetworkParams, ZERO_HASH};
    use std::sync::Arc;

    fn build_uniform_chain(
        store: &MemoryBlockStore,
        params: &NetworkParams,
        length: u64,
        bits: u32,
        spacing: u64,
    ) -> StoredBlock {
        let mut tip = store.get_chain_head().unwrap();
        for i in 1..=length {
            let header = BlockHeader::new(
                1,
                tip.hash(),
                ZERO_HASH,
                params.genesis.timestamp + i * spacing,
                bits,
                i,
            );
            tip = tip.build(header);
            store.put(&tip).unwrap();
        }
        tip
    }

    fn next_header(tip: &StoredBlock, bits: u32, spacing: u64) -> BlockHeader {
        BlockHeader::new(1, tip.hash(), ZERO_HASH, tip.header().timestamp + spacing, bits, 0)
    }

    #[test]
    fn dgw3_young_chain_expects_pow_limit() {
        let params = NetworkParams::testnet();
        let store = Arc::new(MemoryBlockStore::new(&params));
        let backend = HeaderOnlyBackend::new(store.clone());
        let tip = build_uniform_chain(&store, &params, 10, params.pow_limit_bits, 150);

        check_dgw3(&tip, &next_header(&tip, params.pow_limit_bits, 150), &params, &backend).unwrap();
        assert!(check_dgw3(&tip, &next_header(&tip, 0x1c0ffff0, 150), &params, &backend).is_err());
    }

    #[test]
    fn dgw3_on_pace_chain_keeps_the_average() {
        // 30 blocks at the pow limit, exactly on schedule. The sampled
        // window spans 24 blocks with 23 gaps, so the timespan is
        // clamped up to a third of 24 * spacing and the retarget still
        // rounds back to the uniform target's precision.
        let params = NetworkParams::testnet();
        let store = Arc::new(MemoryBlockStore::new(&params));
        let backend = HeaderOnlyBackend::new(store.clone());
        let tip = build_uniform_chain(&store, &params, 30, params.pow_limit_bits, 150);

        let expected = params.pow_limit() * U256::from(23u64) / U256::from(24u64);
        let expected_bits = target_to_compact(expected);
        check_dgw3(&tip, &next_header(&tip, expected_bits, 150), &params, &backend).unwrap();
    }

    #[test]
    fn dgw3_fast_chain_is_clamped_to_a_third() {
        // Blocks arriving instantly: the actual timespan clamps to
        // target/3 and the expected target shrinks accordingly.
        let params = NetworkParams::testnet();
        let store = Arc::new(MemoryBlockStore::new(&params));
        let backend = HeaderOnlyBackend::new(store.clone());
        let tip = build_uniform_chain(&store, &params, 30, params.pow_limit_bits, 0);

        let expected = params.pow_limit() / U256::from(3u64);
        let expected_bits = target_to_compact(expected);
        check_dgw3(&tip, &next_header(&tip, expected_bits, 0), &params, &backend).unwrap();

        assert!(check_dgw3(&tip, &next_header(&tip, params.pow_limit_bits, 0), &params, &backend).is_err());
    }

    #[test]
    fn dgw_young_chain_expects_pow_limit() {
        let params = NetworkParams::mainnet();
        let store = Arc::new(MemoryBlockStore::new(&params));
        let backend = HeaderOnlyBackend::new(store.clone());
        let tip = build_uniform_chain(&store, &params, 10, params.pow_limit_bits, 150);

        check_dgw(&tip, &next_header(&tip, params.pow_limit_bits, 150), &params, &backend).unwrap();
    }

    #[test]
    fn dgw_on_pace_chain_keeps_its_difficulty() {
        // With every gap equal to the target spacing the smart average
        // equals the spacing, the shift is 1 and the timespans cancel.
        let params = NetworkParams::mainnet();
        let store = Arc::new(MemoryBlockStore::new(&params));
        let backend = HeaderOnlyBackend::new(store.clone());
        let tip = build_uniform_chain(&store, &params, 40, params.pow_limit_bits, 150);

        check_dgw(&tip, &next_header(&tip, params.pow_limit_bits, 150), &params, &backend).unwrap();
    }
}
