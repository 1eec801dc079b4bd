//! Chain observers and the executors their callbacks run on.

use consensus_core::errors::ScriptError;
use consensus_core::{Hash, StoredBlock, Transaction};
use std::sync::Arc;

/// How a new block relates to the best chain at notification time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NewBlockType {
    BestChain,
    SideChain,
}

/// Observer of chain growth and reorganizations.
///
/// Listeners registered with [`ListenerExecutor::Inline`] run on the
/// thread that added the block, while it holds the chain lock; they
/// must not call back into mutating [`crate::ChainManager`] methods.
/// Transaction deliveries for one block arrive in block order with a
/// relativity offset counting 0, 1, 2, …
pub trait ChainListener: Send + Sync {
    /// Whether the listener wants `tx` delivered. Script errors are
    /// logged by the caller and treated as "not relevant".
    fn is_transaction_relevant(&self, _tx: &Transaction) -> Result<bool, ScriptError> {
        Ok(false)
    }

    /// A relevant transaction was found in a block. Each listener
    /// receives its own copy of the transaction.
    fn receive_from_block(
        &self,
        _tx: Transaction,
        _block: &StoredBlock,
        _block_type: NewBlockType,
        _relativity_offset: usize,
    ) {
    }

    /// A filtered block matched `txid` but the transaction itself was
    /// not relayed (it may already be known from a loose broadcast).
    fn notify_transaction_is_in_block(
        &self,
        _txid: &Hash,
        _block: &StoredBlock,
        _block_type: NewBlockType,
        _relativity_offset: usize,
    ) {
    }

    /// The best chain grew by `block`. Always follows the transaction
    /// deliveries for the same block.
    fn notify_new_best_block(&self, _block: &StoredBlock) {}

    /// The best chain was reorganized. `old_blocks` and `new_blocks`
    /// run head-to-split and exclude the split point itself.
    fn reorganize(&self, _split_point: &StoredBlock, _old_blocks: &[StoredBlock], _new_blocks: &[StoredBlock]) {}
}

/// Where a listener's callbacks execute.
///
/// Inline listeners run synchronously and take part in false-positive
/// accounting. Spawned listeners are fire-and-forget on a tokio
/// runtime; their panics and results never reach the chain engine.
#[derive(Clone)]
pub enum ListenerExecutor {
    Inline,
    Spawn(tokio::runtime::Handle),
}

impl ListenerExecutor {
    pub fn is_inline(&self) -> bool {
        matches!(self, ListenerExecutor::Inline)
    }
}

/// A registered listener together with its executor.
#[derive(Clone)]
pub(crate) struct ListenerRegistration {
    pub listener: Arc<dyn ChainListener>,
    pub executor: ListenerExecutor,
}
