//! Retry policy for pod-level task attempts.
//!
//! Only errors the backend classifies as retryable (init-container failure,
//! pending-phase timeout) are retried; the interval grows exponentially
//! from the initial value.

use std::time::Duration;

/// Exponential-backoff retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries (not counting the initial attempt).
    pub max_retries: u32,
    /// Interval before the first retry; doubles on each subsequent retry.
    pub initial_interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_interval: Duration) -> Self {
        Self {
            max_retries,
            initial_interval,
        }
    }

    /// A policy with no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_interval: Duration::ZERO,
        }
    }

    /// Whether another attempt is allowed after `retries` retries already
    /// happened.
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Backoff interval before retry number `retry` (0-indexed).
    pub fn interval(&self, retry: u32) -> Duration {
        self.initial_interval
            .checked_mul(1u32 << retry.min(16))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    /// Task default: 2 retries at 1-second initial interval.
    fn default() -> Self {
        Self::new(2, Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_allows_two_retries() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn test_none_policy_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.should_retry(0));
    }

    #[test]
    fn test_interval_grows_exponentially() {
        let policy = RetryPolicy::new(4, Duration::from_secs(1));
        assert_eq!(policy.interval(0), Duration::from_secs(1));
        assert_eq!(policy.interval(1), Duration::from_secs(2));
        assert_eq!(policy.interval(2), Duration::from_secs(4));
    }

    #[test]
    fn test_interval_saturates() {
        let policy = RetryPolicy::new(64, Duration::from_secs(u64::MAX / 2));
        assert_eq!(policy.interval(40), Duration::MAX);
    }
}
