//! Retry policy for pushing operations.

use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Failed attempts before an operation is parked
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_factor: 2.0,
            max_retries: crate::queue::DEFAULT_MAX_RETRIES,
        }
    }
}

/// Delay before retrying after the `attempt`-th failure (1-based):
/// `min(base * factor^(attempt-1), max)`.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let delay_ms = config.base_delay.as_millis() as f64
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_millis(delay_ms.min(config.max_delay.as_millis() as f64) as u64)
}

/// `calculate_backoff` with the default policy, in milliseconds.
pub fn calculate_backoff_delay(attempt: u32) -> u64 {
    calculate_backoff(attempt, &RetryConfig::default()).as_millis() as u64
}
