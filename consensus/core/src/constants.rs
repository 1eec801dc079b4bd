/// Current block version.
pub const BLOCK_VERSION: u32 = 1;

/// Number of seconds a block timestamp may run ahead of our clock.
pub const ALLOWED_TIME_DRIFT: u64 = 2 * 60 * 60;

/// Lock times below this value are block heights, at or above it they
/// are unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number that marks a transaction input as final.
pub const SEQUENCE_FINAL: u32 = u32::MAX;
