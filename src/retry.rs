//! Per-key exponential backoff for failed reconciles.
//!
//! Each failure of a key doubles its delay, starting at
//! [`RetryConfig::initial_delay`] and capped at [`RetryConfig::max_delay`].
//! `forget` resets the key once a reconcile succeeds.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

/// Backoff shape for failing keys
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            backoff_multiplier: 2.0,
        }
    }
}

/// Tracks consecutive failures per key
#[derive(Debug, Default)]
pub struct ItemRateLimiter {
    config: RetryConfig,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemRateLimiter {
    /// Limiter with the given backoff shape
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure of `key` and return how long to wait before retrying it
    pub fn when(&self, key: &str) -> Duration {
        let attempts = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.to_string()).or_insert(0);
            let attempts = *count;
            *count = count.saturating_add(1);
            attempts
        };

        let exp = self.config.backoff_multiplier.powi(attempts.min(i32::MAX as u32) as i32);
        let secs = self.config.initial_delay.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.config.max_delay.as_secs_f64() {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Number of failures recorded for `key` since the last `forget`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }

    /// Reset `key` after success
    pub fn forget(&self, key: &str) {
        self.failures.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> ItemRateLimiter {
        ItemRateLimiter::new(RetryConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        })
    }

    #[test]
    fn test_delay_doubles_per_failure() {
        let limiter = limiter();
        assert_eq!(limiter.when("ns/m"), Duration::from_millis(10));
        assert_eq!(limiter.when("ns/m"), Duration::from_millis(20));
        assert_eq!(limiter.when("ns/m"), Duration::from_millis(40));
        assert_eq!(limiter.num_requeues("ns/m"), 3);
    }

    #[test]
    fn test_delay_is_capped() {
        let limiter = limiter();
        for _ in 0..10 {
            limiter.when("ns/m");
        }
        assert_eq!(limiter.when("ns/m"), Duration::from_millis(100));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter();
        limiter.when("ns/a");
        limiter.when("ns/a");
        assert_eq!(limiter.when("ns/b"), Duration::from_millis(10));
    }

    #[test]
    fn test_forget_resets() {
        let limiter = limiter();
        limiter.when("ns/m");
        limiter.when("ns/m");
        limiter.forget("ns/m");
        assert_eq!(limiter.num_requeues("ns/m"), 0);
        assert_eq!(limiter.when("ns/m"), Duration::from_millis(10));
    }

    #[test]
    fn test_huge_attempt_counts_do_not_overflow() {
        let limiter = ItemRateLimiter::default();
        for _ in 0..2000 {
            limiter.when("ns/m");
        }
        assert_eq!(limiter.when("ns/m"), Duration::from_secs(1000));
    }
}
