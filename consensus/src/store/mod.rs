//! Persistence contracts consumed by the chain engine.
//!
//! The engine itself stores nothing; every lookup and mutation goes
//! through these traits. [`BlockStore`] is enough for header-only
//! operation. Full verification additionally requires
//! [`UndoableBlockStore`], whose transactional methods must pair every
//! `connect`/`disconnect` with either `do_set_chain_head` (commit) or
//! `not_setting_chain_head` (abort); the chain manager enforces the
//! pairing.

mod memory;

pub use memory::MemoryBlockStore;

use consensus_core::{Block, Hash, OutPoint, StoredBlock};

use crate::error::{ChainError, StoreError};

/// An unspent transaction output tracked by a fully verifying store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoEntry {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: Vec<u8>,
    /// Height of the block that created the output.
    pub height: u64,
    pub coinbase: bool,
}

/// The net effect of connecting one block on the unspent-output set.
#[derive(Clone, Debug, Default)]
pub struct TransactionOutputChanges {
    pub created: Vec<UtxoEntry>,
    pub spent: Vec<UtxoEntry>,
}

/// Header-scope block persistence.
pub trait BlockStore: Send + Sync {
    /// The stored block with the most cumulative work.
    fn get_chain_head(&self) -> Result<StoredBlock, StoreError>;

    /// Looks up a stored block by header hash.
    fn get(&self, hash: &Hash) -> Result<Option<StoredBlock>, StoreError>;

    /// Persists a stored block.
    fn put(&self, block: &StoredBlock) -> Result<(), StoreError>;

    /// Commits a new chain head, along with any transaction-level state
    /// opened since the last commit or abort.
    fn do_set_chain_head(&self, head: &StoredBlock) -> Result<(), StoreError>;

    /// Aborts any transaction-level state opened since the last commit.
    /// Must be idempotent: calling it with nothing open is a no-op.
    fn not_setting_chain_head(&self) -> Result<(), StoreError>;
}

/// Full-verification block persistence: keeps whole blocks plus the
/// undo data needed to roll their effects back during a reorganization.
pub trait UndoableBlockStore: BlockStore {
    /// As [`BlockStore::get`], but only returns blocks whose undo data
    /// is still available. Returns `None` for unknown or pruned blocks.
    fn get_once_undoable(&self, hash: &Hash) -> Result<Option<StoredBlock>, StoreError>;

    /// Persists a stored block together with its full contents and, if
    /// its transactions were already connected, the resulting output
    /// changes.
    fn put_undoable(
        &self,
        block: &StoredBlock,
        contents: &Block,
        changes: Option<&TransactionOutputChanges>,
    ) -> Result<(), StoreError>;

    /// Applies each transaction of `block` to the unspent-output set,
    /// verifying scripts and double spends on the way.
    fn connect_transactions(&self, height: u64, block: &Block) -> Result<TransactionOutputChanges, ChainError>;

    /// As [`UndoableBlockStore::connect_transactions`], reloading the
    /// block contents from the store. Fails with [`ChainError::Pruned`]
    /// if the contents have been discarded.
    fn connect_stored_block(&self, block: &StoredBlock) -> Result<TransactionOutputChanges, ChainError>;

    /// Rolls back the effect of a previously connected block. Fails
    /// with [`ChainError::Pruned`] if the undo data has been discarded.
    fn disconnect_transactions(&self, block: &StoredBlock) -> Result<(), ChainError>;
}
