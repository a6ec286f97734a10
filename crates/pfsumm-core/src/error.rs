use thiserror::Error;

/// Rejected option values. Surfaced before any line is processed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionsError {
    #[error("invalid day filter {0:?} (expected today, yesterday or CCYY-MM-DD)")]
    InvalidDayFilter(String),
    #[error("invalid VERP munging level {0} (expected 0, 1 or 2)")]
    InvalidVerpLevel(u8),
    #[error("fallback year {0} out of range")]
    YearOutOfRange(i32),
    #[error("invalid detail limit {0:?} (expected a non-negative count, \"all\" or \"none\")")]
    InvalidDetailLimit(String),
}

/// Ad hoc aggregate-table queries with an out-of-range key. Reaching
/// this from inside the aggregation path indicates a bug in the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("hour {0} out of range (expected 0..=23)")]
    HourOutOfRange(u8),
}
