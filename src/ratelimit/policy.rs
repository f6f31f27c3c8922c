//! Timing policy for the rate limiter.

use std::time::Duration;

use crate::config::LimiterConfig;

/// Hard cap on the backoff exponent so `2^retry` cannot overflow.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// The constants that drive admission and backoff decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterPolicy {
    /// Length of the rolling request window
    pub window: Duration,
    /// Requests admitted per window
    pub max_requests: u32,
    /// Base delay for exponential backoff
    pub retry_base_delay: Duration,
    /// Retry ceiling for throttled requests
    pub max_retries: u32,
    /// Floor applied to every admission delay
    pub min_request_interval: Duration,
    /// Poll interval while an identical identity is pending
    pub pending_poll_interval: Duration,
}

impl LimiterPolicy {
    /// `retry_base_delay * 2^retry`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(MAX_BACKOFF_EXPONENT);
        self.retry_base_delay.saturating_mul(factor)
    }
}

impl Default for LimiterPolicy {
    fn default() -> Self {
        Self::from(&LimiterConfig::default())
    }
}

impl From<&LimiterConfig> for LimiterPolicy {
    fn from(config: &LimiterConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            max_requests: config.max_requests_per_window,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_retries: config.max_retries,
            min_request_interval: Duration::from_millis(config.min_request_interval_ms),
            pending_poll_interval: Duration::from_millis(config.pending_poll_interval_ms),
        }
    }
}
