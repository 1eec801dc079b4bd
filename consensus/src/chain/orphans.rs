use consensus_core::{Block, Hash, Transaction};
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// Default number of pending blocks kept while their parents are missing.
pub const DEFAULT_ORPHAN_CAPACITY: usize = 100;

/// Bloom-filter data that arrived alongside a header.
#[derive(Clone, Debug)]
pub struct FilteredData {
    /// Every matched transaction id, in block order.
    pub tx_hashes: Vec<Hash>,
    /// The subset of matched transactions that were actually relayed.
    pub transactions: HashMap<Hash, Transaction>,
}

/// A block whose parent is not yet known, plus any filter data it
/// arrived with.
#[derive(Clone, Debug)]
pub(crate) struct OrphanBlock {
    pub block: Block,
    pub filtered: Option<FilteredData>,
}

impl OrphanBlock {
    pub fn new(block: Block, filtered: Option<FilteredData>, keep_transactions: bool) -> Self {
        // Header-only operation has no use for the transaction list
        // while the block sits in the pool.
        let block = if keep_transactions { block } else { block.as_header_block() };
        Self { block, filtered }
    }
}

/// Insertion-ordered, bounded buffer of blocks waiting for a parent.
///
/// When full, the oldest entry is evicted; a well-behaved sync fills
/// parents quickly enough that eviction means the peer is feeding us
/// junk or serving blocks wildly out of order.
pub(crate) struct OrphanPool {
    capacity: usize,
    order: VecDeque<Hash>,
    blocks: HashMap<Hash, OrphanBlock>,
}

impl OrphanPool {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, order: VecDeque::new(), blocks: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&OrphanBlock> {
        self.blocks.get(hash)
    }

    /// The parent hash an orphan is waiting for.
    pub fn parent_of(&self, hash: &Hash) -> Option<Hash> {
        self.blocks.get(hash).map(|orphan| orphan.block.header.prev_block_hash)
    }

    pub fn insert(&mut self, hash: Hash, orphan: OrphanBlock) {
        if self.blocks.contains_key(&hash) {
            return;
        }
        while self.blocks.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.blocks.remove(&oldest);
                warn!("orphan pool full, evicting {}", oldest);
            } else {
                break;
            }
        }
        self.order.push_back(hash);
        self.blocks.insert(hash, orphan);
    }

    pub fn remove(&mut self, hash: &Hash) -> Option<OrphanBlock> {
        let removed = self.blocks.remove(hash);
        if removed.is_some() {
            self.order.retain(|h| h != hash);
        }
        removed
    }

    /// Snapshot of the pending hashes in insertion order.
    pub fn ordered_hashes(&self) -> Vec<Hash> {
        self.order.iter().copied().collect()
    }

    /// Walks from `hash` towards its ancestors and returns the topmost
    /// orphan reachable, or `None` if `hash` is not an orphan itself.
    pub fn orphan_root(&self, hash: &Hash) -> Option<Block> {
        let mut cursor = self.blocks.get(hash)?;
        while let Some(parent) = self.blocks.get(&cursor.block.header.prev_block_hash) {
            cursor = parent;
        }
        Some(cursor.block.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consensus_core::{BlockHeader, ZERO_HASH};

    fn block(prev: Hash, nonce: u64) -> Block {
        Block::from_header(BlockHeader::new(1, prev, ZERO_HASH, 1_390_095_618, 0x1e0fffff, nonce))
    }

    fn insert(pool: &mut OrphanPool, block: Block) -> Hash {
        let hash = block.hash();
        pool.insert(hash, OrphanBlock::new(block, None, true));
        hash
    }

    #[test]
    fn keeps_insertion_order() {
        let mut pool = OrphanPool::new(10);
        let a = insert(&mut pool, block(ZERO_HASH, 1));
        let b = insert(&mut pool, block(ZERO_HASH, 2));
        let c = insert(&mut pool, block(ZERO_HASH, 3));
        assert_eq!(pool.ordered_hashes(), vec![a, b, c]);

        pool.remove(&b);
        assert_eq!(pool.ordered_hashes(), vec![a, c]);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut pool = OrphanPool::new(2);
        let a = insert(&mut pool, block(ZERO_HASH, 1));
        let b = insert(&mut pool, block(ZERO_HASH, 2));
        let c = insert(&mut pool, block(ZERO_HASH, 3));

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&a));
        assert_eq!(pool.ordered_hashes(), vec![b, c]);
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let mut pool = OrphanPool::new(10);
        let b = block(ZERO_HASH, 1);
        insert(&mut pool, b.clone());
        insert(&mut pool, b);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn walks_to_orphan_root() {
        let mut pool = OrphanPool::new(10);
        let top = block(Hash::from_le_u64([9, 9, 9, 9]), 1);
        let top_hash = insert(&mut pool, top.clone());
        let mid = block(top_hash, 2);
        let mid_hash = insert(&mut pool, mid);
        let tip = block(mid_hash, 3);
        let tip_hash = insert(&mut pool, tip);

        assert_eq!(pool.orphan_root(&tip_hash).map(|b| b.hash()), Some(top.hash()));
        assert_eq!(pool.orphan_root(&top_hash).map(|b| b.hash()), Some(top.hash()));
        assert!(pool.orphan_root(&Hash::from_le_u64([1, 2, 3, 4])).is_none());
    }

    #[test]
    fn drops_transactions_in_header_only_mode() {
        let header = BlockHeader::new(1, ZERO_HASH, ZERO_HASH, 1_390_095_618, 0x1e0fffff, 0);
        let full = Block::new(header, vec![]);
        let orphan = OrphanBlock::new(full.clone(), None, false);
        assert!(orphan.block.transactions.is_none());
        let kept = OrphanBlock::new(full, None, true);
        assert!(kept.block.transactions.is_some());
    }
}
