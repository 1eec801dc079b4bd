use primitive_types::U256;

use crate::hash::Hash;
use crate::header::BlockHeader;

/// A block header annotated with its position in the chain: the height
/// above genesis and the cumulative work of the chain ending here.
///
/// Immutable once constructed. Equality is by header hash.
#[derive(Clone, Copy, Debug)]
pub struct StoredBlock {
    header: BlockHeader,
    hash: Hash,
    height: u64,
    chain_work: U256,
}

impl StoredBlock {
    pub fn new(header: BlockHeader, height: u64, chain_work: U256) -> Self {
        let hash = header.hash();
        Self { header, hash, height, chain_work }
    }

    /// Wraps a genesis header: height zero, work equal to its own.
    pub fn genesis(header: BlockHeader) -> Self {
        let work = header.work();
        Self::new(header, 0, work)
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// The header hash, computed once at construction.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Total work of the chain from genesis up to and including this block.
    pub fn chain_work(&self) -> U256 {
        self.chain_work
    }

    /// Creates the record for a child block of this one.
    pub fn build(&self, header: BlockHeader) -> StoredBlock {
        StoredBlock::new(header, self.height + 1, self.chain_work + header.work())
    }

    /// True if this chain has strictly more cumulative work than `other`'s.
    pub fn more_work_than(&self, other: &StoredBlock) -> bool {
        self.chain_work > other.chain_work
    }
}

impl PartialEq for StoredBlock {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for StoredBlock {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ZERO_HASH;

    fn header(prev: Hash, nonce: u64) -> BlockHeader {
        BlockHeader::new(1, prev, ZERO_HASH, 1_390_095_618 + nonce, 0x1e0fffff, nonce)
    }

    #[test]
    fn build_links_height_and_work() {
        let genesis = StoredBlock::genesis(header(ZERO_HASH, 0));
        let child_header = header(genesis.hash(), 1);
        let child = genesis.build(child_header);

        assert_eq!(child.height(), 1);
        assert_eq!(child.chain_work(), genesis.chain_work() + child_header.work());
        assert_eq!(child.header().prev_block_hash, genesis.hash());
    }

    #[test]
    fn more_work_orders_branches() {
        let genesis = StoredBlock::genesis(header(ZERO_HASH, 0));
        let a = genesis.build(header(genesis.hash(), 1));
        let b = a.build(header(a.hash(), 2));

        assert!(b.more_work_than(&a));
        assert!(!a.more_work_than(&b));
        assert!(!a.more_work_than(&a));
    }

    #[test]
    fn equality_is_by_hash() {
        let genesis = StoredBlock::genesis(header(ZERO_HASH, 0));
        let same = StoredBlock::new(*genesis.header(), 0, genesis.chain_work());
        assert_eq!(genesis, same);
    }
}
