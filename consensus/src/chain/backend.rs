use consensus_core::{Block, Hash, StoredBlock};
use std::sync::Arc;

use crate::error::{ChainError, StoreError};
use crate::store::{BlockStore, TransactionOutputChanges, UndoableBlockStore};

/// The capability set that separates header-only from fully verifying
/// operation.
///
/// The chain manager drives everything through this trait; the two
/// implementations below decide what "store this block" and "connect
/// these transactions" mean for their store.
pub trait ChainBackend: Send + Sync {
    /// Whether blocks must carry transactions and have them verified
    /// against the unspent-output set.
    fn should_verify_transactions(&self) -> bool;

    /// Plain lookup, used for ancestor walks (difficulty, medians,
    /// split-point search).
    fn get(&self, hash: &Hash) -> Result<Option<StoredBlock>, StoreError>;

    /// Lookup restricted to blocks this mode can build on. In full
    /// verification that means blocks whose undo data still exists.
    fn block_in_scope(&self, hash: &Hash) -> Result<Option<StoredBlock>, StoreError>;

    /// The stored chain head.
    fn get_chain_head(&self) -> Result<StoredBlock, StoreError>;

    /// Builds the stored record for `block` on top of `prev` and
    /// persists it, with the output changes of an already-run connect
    /// when full verification produced them.
    fn add_to_block_store(
        &self,
        prev: &StoredBlock,
        block: &Block,
        changes: Option<&TransactionOutputChanges>,
    ) -> Result<StoredBlock, ChainError>;

    /// Connects the transactions of an in-memory block at `height`.
    /// Only called when [`ChainBackend::should_verify_transactions`].
    fn connect_transactions(&self, height: u64, block: &Block) -> Result<TransactionOutputChanges, ChainError>;

    /// Connects a block reloaded from the store during a reorganization.
    fn connect_stored_block(&self, block: &StoredBlock) -> Result<TransactionOutputChanges, ChainError>;

    /// Rolls back a previously connected block.
    fn disconnect_transactions(&self, block: &StoredBlock) -> Result<(), ChainError>;

    /// Commits the new chain head and any open store transaction.
    fn do_set_chain_head(&self, head: &StoredBlock) -> Result<(), StoreError>;

    /// Aborts any open store transaction. Idempotent.
    fn not_setting_chain_head(&self) -> Result<(), StoreError>;
}

/// Header-only (SPV) operation over any [`BlockStore`].
pub struct HeaderOnlyBackend {
    store: Arc<dyn BlockStore>,
}

impl HeaderOnlyBackend {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }
}

impl ChainBackend for HeaderOnlyBackend {
    fn should_verify_transactions(&self) -> bool {
        false
    }

    fn get(&self, hash: &Hash) -> Result<Option<StoredBlock>, StoreError> {
        self.store.get(hash)
    }

    fn block_in_scope(&self, hash: &Hash) -> Result<Option<StoredBlock>, StoreError> {
        self.store.get(hash)
    }

    fn get_chain_head(&self) -> Result<StoredBlock, StoreError> {
        self.store.get_chain_head()
    }

    fn add_to_block_store(
        &self,
        prev: &StoredBlock,
        block: &Block,
        _changes: Option<&TransactionOutputChanges>,
    ) -> Result<StoredBlock, ChainError> {
        let stored = prev.build(block.header);
        self.store.put(&stored)?;
        Ok(stored)
    }

    fn connect_transactions(&self, _height: u64, _block: &Block) -> Result<TransactionOutputChanges, ChainError> {
        Err(StoreError::Unsupported.into())
    }

    fn connect_stored_block(&self, _block: &StoredBlock) -> Result<TransactionOutputChanges, ChainError> {
        Err(StoreError::Unsupported.into())
    }

    fn disconnect_transactions(&self, _block: &StoredBlock) -> Result<(), ChainError> {
        Err(StoreError::Unsupported.into())
    }

    fn do_set_chain_head(&self, head: &StoredBlock) -> Result<(), StoreError> {
        self.store.do_set_chain_head(head)
    }

    fn not_setting_chain_head(&self) -> Result<(), StoreError> {
        self.store.not_setting_chain_head()
    }
}

/// Full verification over an [`UndoableBlockStore`] that maintains the
/// unspent-output set.
pub struct FullValidationBackend {
    store: Arc<dyn UndoableBlockStore>,
}

impl FullValidationBackend {
    pub fn new(store: Arc<dyn UndoableBlockStore>) -> Self {
        Self { store }
    }
}

impl ChainBackend for FullValidationBackend {
    fn should_verify_transactions(&self) -> bool {
        true
    }

    fn get(&self, hash: &Hash) -> Result<Option<StoredBlock>, StoreError> {
        self.store.get(hash)
    }

    fn block_in_scope(&self, hash: &Hash) -> Result<Option<StoredBlock>, StoreError> {
        self.store.get_once_undoable(hash)
    }

    fn get_chain_head(&self) -> Result<StoredBlock, StoreError> {
        self.store.get_chain_head()
    }

    fn add_to_block_store(
        &self,
        prev: &StoredBlock,
        block: &Block,
        changes: Option<&TransactionOutputChanges>,
    ) -> Result<StoredBlock, ChainError> {
        let stored = prev.build(block.header);
        self.store.put_undoable(&stored, block, changes)?;
        Ok(stored)
    }

    fn connect_transactions(&self, height: u64, block: &Block) -> Result<TransactionOutputChanges, ChainError> {
        self.store.connect_transactions(height, block)
    }

    fn connect_stored_block(&self, block: &StoredBlock) -> Result<TransactionOutputChanges, ChainError> {
        self.store.connect_stored_block(block)
    }

    fn disconnect_transactions(&self, block: &StoredBlock) -> Result<(), ChainError> {
        self.store.disconnect_transactions(block)
    }

    fn do_set_chain_head(&self, head: &StoredBlock) -> Result<(), StoreError> {
        self.store.do_set_chain_head(head)
    }

    fn not_setting_chain_head(&self) -> Result<(), StoreError> {
        self.store.not_setting_chain_head()
    }
}
