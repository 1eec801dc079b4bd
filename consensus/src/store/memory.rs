use consensus_core::{Hash, NetworkParams, StoredBlock};
use std::collections::HashMap;
use std::sync::RwLock;

use super::BlockStore;
use crate::error::StoreError;

/// Header-scope block store backed by a hash map.
///
/// Useful for SPV wallets that re-sync headers on startup, and for
/// tests. Seeds itself with the network's genesis block.
pub struct MemoryBlockStore {
    inner: RwLock<Inner>,
}

struct Inner {
    blocks: HashMap<Hash, StoredBlock>,
    chain_head: StoredBlock,
}

impl MemoryBlockStore {
    pub fn new(params: &NetworkParams) -> Self {
        let genesis = StoredBlock::genesis(params.genesis);
        let mut blocks = HashMap::new();
        blocks.insert(genesis.hash(), genesis);
        Self { inner: RwLock::new(Inner { blocks, chain_head: genesis }) }
    }

    /// Number of stored blocks.
    pub fn block_count(&self) -> usize {
        self.inner.read().unwrap().blocks.len()
    }
}

impl BlockStore for MemoryBlockStore {
    fn get_chain_head(&self) -> Result<StoredBlock, StoreError> {
        Ok(self.inner.read().unwrap().chain_head)
    }

    fn get(&self, hash: &Hash) -> Result<Option<StoredBlock>, StoreError> {
        Ok(self.inner.read().unwrap().blocks.get(hash).copied())
    }

    fn put(&self, block: &StoredBlock) -> Result<(), StoreError> {
        self.inner.write().unwrap().blocks.insert(block.hash(), *block);
        Ok(())
    }

    fn do_set_chain_head(&self, head: &StoredBlock) -> Result<(), StoreError> {
        self.inner.write().unwrap().chain_head = *head;
        Ok(())
    }

    fn not_setting_chain_head(&self) -> Result<(), StoreError> {
        // Nothing transactional to roll back in memory.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consensus_core::BlockHeader;

    #[test]
    fn seeds_genesis_as_head() {
        let params = NetworkParams::testnet();
        let store = MemoryBlockStore::new(&params);

        let head = store.get_chain_head().unwrap();
        assert_eq!(head.height(), 0);
        assert_eq!(head.hash(), params.genesis_hash());
        assert!(store.get(&params.genesis_hash()).unwrap().is_some());
    }

    #[test]
    fn put_get_and_advance_head() {
        let params = NetworkParams::testnet();
        let store = MemoryBlockStore::new(&params);
        let genesis = store.get_chain_head().unwrap();

        let child_header =
            BlockHeader::new(1, genesis.hash(), consensus_core::ZERO_HASH, 1_390_095_738, params.pow_limit_bits, 5);
        let child = genesis.build(child_header);
        store.put(&child).unwrap();
        store.do_set_chain_head(&child).unwrap();

        assert_eq!(store.get(&child.hash()).unwrap(), Some(child));
        assert_eq!(store.get_chain_head().unwrap(), child);
        assert_eq!(store.block_count(), 2);
    }
}
