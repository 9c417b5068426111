//! Retry backoff schedule.
//!
//! The schedule is a fixed lookup table rather than a formula with jitter:
//! every distinct delay becomes a delay tier queue in the broker, so the set
//! of possible delays has to stay small.

/// Delay in seconds for death counts 1 through 17.
pub const BACKOFF_SCHEDULE: [u64; 17] = [
    3,      // 3 seconds
    30,     // 30 seconds
    90,     // 1.5 minutes
    240,    // 4 minutes
    600,    // 10 minutes
    1_200,  // 20 minutes
    2_400,  // 40 minutes
    3_600,  // 1 hour
    7_200,  // 2 hours
    10_800, // 3 hours
    14_400, // 4 hours
    21_600, // 6 hours
    28_800, // 8 hours
    36_000, // 10 hours
    50_400, // 14 hours
    64_800, // 18 hours
    86_400, // 24 hours
];

/// Delay used for any count outside the table.
pub const DEFAULT_BACKOFF: u64 = 86_400;

/// Pluggable retry schedule: death count to delay in seconds
pub type BackoffFn = std::sync::Arc<dyn Fn(u64) -> u64 + Send + Sync>;

/// Delay in seconds before redelivering a message that has failed `count` times
///
/// ```rust
/// use job_relay::backoff::retry_delay;
///
/// assert_eq!(retry_delay(1), 3);
/// assert_eq!(retry_delay(2), 30);
/// assert_eq!(retry_delay(0), 86_400);
/// assert_eq!(retry_delay(18), 86_400);
/// ```
pub fn retry_delay(count: u64) -> u64 {
    usize::try_from(count)
        .ok()
        .and_then(|c| c.checked_sub(1))
        .and_then(|index| BACKOFF_SCHEDULE.get(index))
        .copied()
        .unwrap_or(DEFAULT_BACKOFF)
}

/// The default schedule as a [`BackoffFn`]
pub fn default_backoff() -> BackoffFn {
    std::sync::Arc::new(retry_delay)
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
