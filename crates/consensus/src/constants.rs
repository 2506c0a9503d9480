//! Consensus-wide constants shared across validation.

/// The only block version currently produced or accepted (network rule).
pub const BLOCK_VERSION: u32 = 1;
/// The only transaction version currently produced or accepted (network rule).
pub const TX_VERSION: u32 = 1;
/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;
/// The maximum number of transaction IDs carried by a single inventory message.
pub const MAX_INV_PER_TX_INV_MSG: usize = 50_000;
/// Lock times below this threshold are interpreted as a blue score,
/// at or above it as a unix timestamp in milliseconds.
pub const LOCK_TIME_THRESHOLD: u64 = 500_000_000_000;
/// The sequence value that exempts an input from lock-time rules.
pub const MAX_TX_IN_SEQUENCE_NUM: u64 = u64::MAX;
