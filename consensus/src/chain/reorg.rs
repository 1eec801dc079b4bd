//! Fork resolution helpers: split-point search, branch extraction and
//! the median-time rule.

use consensus_core::errors::VerificationError;
use consensus_core::StoredBlock;

use super::backend::ChainBackend;
use crate::error::ChainError;

/// Locates the point at which the chains ending in `new_head` and
/// `old_head` diverge. Returns one of the two heads if they do not
/// actually diverge but lie on the same chain.
///
/// ```text
///    A -> B -> C -> D
///         \--> E -> F -> G
/// ```
/// For `old_head = D` and `new_head = G` the split point is `B`.
pub(crate) fn find_split(
    new_head: &StoredBlock,
    old_head: &StoredBlock,
    backend: &dyn ChainBackend,
) -> Result<StoredBlock, ChainError> {
    let mut current_cursor = *old_head;
    let mut new_cursor = *new_head;
    while current_cursor.hash() != new_cursor.hash() {
        if current_cursor.height() > new_cursor.height() {
            current_cursor = backend
                .get(&current_cursor.header().prev_block_hash)?
                .ok_or(VerificationError::DisjointFork)?;
        } else {
            new_cursor = backend
                .get(&new_cursor.header().prev_block_hash)?
                .ok_or(VerificationError::DisjointFork)?;
        }
    }
    Ok(current_cursor)
}

/// Returns the contiguous blocks between `higher` and `lower`, ordered
/// head-to-split. `higher` is included, `lower` is not.
pub(crate) fn partial_chain(
    higher: &StoredBlock,
    lower: &StoredBlock,
    backend: &dyn ChainBackend,
) -> Result<Vec<StoredBlock>, ChainError> {
    debug_assert!(higher.height() > lower.height(), "higher and lower are reversed");
    let mut results = Vec::with_capacity((higher.height() - lower.height()) as usize);
    let mut cursor = *higher;
    loop {
        results.push(cursor);
        cursor = backend
            .get(&cursor.header().prev_block_hash)?
            .ok_or(VerificationError::DisjointFork)?;
        if cursor.hash() == lower.hash() {
            break;
        }
    }
    Ok(results)
}

/// Median timestamp of the last 11 blocks ending at `block`. With fewer
/// than 11 ancestors the median is taken over what exists.
pub(crate) fn median_timestamp_of_recent(
    block: &StoredBlock,
    backend: &dyn ChainBackend,
) -> Result<u64, ChainError> {
    let mut timestamps = [0u64; 11];
    let mut unused: i64 = 9;
    timestamps[10] = block.header().timestamp;

    let mut cursor = *block;
    while unused >= 0 {
        match backend.get(&cursor.header().prev_block_hash)? {
            Some(prev) => {
                cursor = prev;
                timestamps[unused as usize] = cursor.header().timestamp;
                unused -= 1;
            }
            None => break,
        }
    }

    let first = (unused + 1) as usize;
    timestamps[first..].sort_unstable();
    Ok(timestamps[(unused + (11 - unused) / 2) as usize])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::backend::HeaderOnlyBackend;
    use crate::store::{BlockStore, MemoryBlockStore};
    use consensus_core::{BlockHeader, NetworkParams, ZERO_HASH};
    use std::sync::Arc;

    struct Fixture {
        backend: HeaderOnlyBackend,
        store: Arc<MemoryBlockStore>,
    }

    impl Fixture {
        fn new() -> (Self, StoredBlock) {
            let params = NetworkParams::testnet();
            let store = Arc::new(MemoryBlockStore::new(&params));
            let genesis = store.get_chain_head().unwrap();
            let backend = HeaderOnlyBackend::new(store.clone());
            (Self { backend, store }, genesis)
        }

        fn extend(&self, parent: &StoredBlock, nonce: u64, timestamp: u64) -> StoredBlock {
            let header = BlockHeader::new(1, parent.hash(), ZERO_HASH, timestamp, 0x1e0fffff, nonce);
            let stored = parent.build(header);
            self.store.put(&stored).unwrap();
            stored
        }
    }

    #[test]
    fn split_of_straight_chain_is_the_lower_block() {
        let (fx, genesis) = Fixture::new();
        let b1 = fx.extend(&genesis, 1, 1_000);
        let b2 = fx.extend(&b1, 2, 1_150);

        assert_eq!(find_split(&b2, &b1, &fx.backend).unwrap(), b1);
        assert_eq!(find_split(&b1, &b2, &fx.backend).unwrap(), b1);
    }

    #[test]
    fn split_of_forked_chain_is_common_ancestor() {
        let (fx, genesis) = Fixture::new();
        let b1 = fx.extend(&genesis, 1, 1_000);
        let b2 = fx.extend(&b1, 2, 1_150);
        let b3 = fx.extend(&b2, 3, 1_300);
        let c2 = fx.extend(&b1, 20, 1_160);
        let c3 = fx.extend(&c2, 21, 1_310);
        let c4 = fx.extend(&c3, 22, 1_460);

        assert_eq!(find_split(&c4, &b3, &fx.backend).unwrap(), b1);
    }

    #[test]
    fn partial_chain_runs_head_to_split_exclusive() {
        let (fx, genesis) = Fixture::new();
        let b1 = fx.extend(&genesis, 1, 1_000);
        let b2 = fx.extend(&b1, 2, 1_150);
        let b3 = fx.extend(&b2, 3, 1_300);

        let blocks = partial_chain(&b3, &genesis, &fx.backend).unwrap();
        assert_eq!(blocks, vec![b3, b2, b1]);
    }

    #[test]
    fn median_of_full_window() {
        let (fx, genesis) = Fixture::new();
        let mut tip = genesis;
        for i in 1..=12u64 {
            tip = fx.extend(&tip, i, 1_000 * i);
        }
        // Window covers timestamps 2000..=12000; the median is 7000.
        assert_eq!(median_timestamp_of_recent(&tip, &fx.backend).unwrap(), 7_000);
    }

    #[test]
    fn median_of_short_chain() {
        let (fx, genesis) = Fixture::new();
        let b1 = fx.extend(&genesis, 1, 2_000);
        let b2 = fx.extend(&b1, 2, 4_000);
        let median = median_timestamp_of_recent(&b2, &fx.backend).unwrap();
        // Window is {genesis_ts, 2000, 4000} and the genesis timestamp
        // is by far the largest, leaving 4000 in the middle.
        assert_eq!(median, 4_000);
    }
}
