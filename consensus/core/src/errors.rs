use primitive_types::U256;
use thiserror::Error;

/// Structural or consensus-rule failure of a block or transaction.
///
/// Any of these invalidates the offending block; the chain engine rolls
/// back whatever store state the failed add opened.
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("block hash does not satisfy the difficulty target")]
    ProofOfWork,

    #[error("difficulty target is out of range")]
    BadTarget,

    #[error("block timestamp too far in the future")]
    TimeTooFarAhead,

    #[error("merkle root does not match the block's transactions")]
    MerkleMismatch,

    #[error("block has no transactions")]
    EmptyBody,

    #[error("misplaced coinbase transaction")]
    MisplacedCoinbase,

    #[error("got a block header while running in full verification mode")]
    HeaderOnlyBlock,

    #[error("filtered blocks cannot be added in full verification mode")]
    FilteredBlock,

    #[error("block contains a non-final transaction")]
    NonFinalTransaction,

    #[error("block timestamp is earlier than the median of recent blocks")]
    TimestampTooEarly,

    #[error("block failed checkpoint lock-in at height {0}")]
    CheckpointMismatch(u64),

    #[error("unexpected change in difficulty at height {height}: {received:#x} vs {expected:#x}")]
    UnexpectedDifficultyChange { height: u64, received: u32, expected: u32 },

    #[error("network provided difficulty bits do not match what was calculated: {received:x} vs {calculated:x}")]
    DifficultyMismatch { received: U256, calculated: U256 },

    #[error("testnet difficulty transition that is not allowed: {0:#x} vs {1:#x}")]
    TestnetDifficulty(u32, u32),

    #[error("difficulty transition point with no way back to the genesis block")]
    BrokenRetargetWalk,

    #[error("block forks the chain but the split point was not found")]
    DisjointFork,
}

/// Failure while probing a transaction's scripts for relevance.
///
/// Scripts we cannot evaluate never invalidate a block; callers log the
/// error and treat the transaction as irrelevant.
#[derive(Error, Debug)]
#[error("failed to evaluate script: {0}")]
pub struct ScriptError(pub String);
