use consensus_core::errors::VerificationError;
use consensus_core::Hash;
use thiserror::Error;

/// Failure of the underlying block store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("block store failure: {0}")]
    Backend(String),

    #[error("operation requires a fully verifying block store")]
    Unsupported,
}

/// Top-level error of a chain-engine operation.
#[derive(Error, Debug)]
pub enum ChainError {
    /// The block violated a consensus rule. The failed add has been
    /// rolled back; the block must not be retried.
    #[error(transparent)]
    Invalid(#[from] VerificationError),

    /// A reorganization needed undo data the store has already
    /// discarded. The operator must rescan from an earlier point.
    #[error("undo data for block {0} has been pruned, rescan required")]
    Pruned(Hash),

    /// The store itself failed; nothing can be concluded about the block.
    #[error(transparent)]
    Store(#[from] StoreError),
}
