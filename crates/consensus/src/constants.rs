//! Consensus-wide constants shared across validation and sync.

/// The minimum allowed block version (network rule).
pub const MIN_BLOCK_VERSION: i32 = 4;
/// Maximum reorg length accepted under normal conditions; state older than
/// this below the tip may be pruned.
pub const MAX_REORG_LENGTH: i32 = 40;
/// Number of ancestor timestamps sampled for the median-time-past rule.
pub const MEDIAN_TIME_SPAN: usize = 11;
