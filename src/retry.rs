//! Backoff policies
//!
//! Two kinds of waiting live here: the per-task retry delay applied when a
//! handler fails (`backoff_base * 2^attempt`, capped), and the policy workers
//! use when the store itself is unavailable.

use crate::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay before re-running a task that failed on `attempt`.
///
/// `backoff_base * 2^attempt`, capped at `max_backoff`. Non-decreasing in
/// `attempt`.
pub fn task_backoff(backoff_base: Duration, attempt: u32, max_backoff: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    backoff_base
        .checked_mul(factor)
        .unwrap_or(max_backoff)
        .min(max_backoff)
}

/// Retry policy for store operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries for a single store call
    pub max_retries: u32,
    /// Initial delay before first retry
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5)
    }
}

impl RetryPolicy {
    /// Create a retry policy with exponential backoff
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// Create a retry policy with fixed delay
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Create a no-retry policy
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_secs(0),
            max_delay: Duration::from_secs(0),
            multiplier: 1.0,
        }
    }

    /// Calculate delay for a given retry attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_secs(0);
        }

        let delay_ms = (self.initial_delay.as_millis() as f64)
            * self.multiplier.powi((attempt - 1).min(i32::MAX as u32) as i32);
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }

    /// Check if retry is allowed for the given attempt
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Task backoff
    // ========================================================================

    #[test]
    fn test_task_backoff_doubles() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(300);
        assert_eq!(task_backoff(base, 0, cap), Duration::from_secs(1));
        assert_eq!(task_backoff(base, 1, cap), Duration::from_secs(2));
        assert_eq!(task_backoff(base, 2, cap), Duration::from_secs(4));
        assert_eq!(task_backoff(base, 3, cap), Duration::from_secs(8));
    }

    #[test]
    fn test_task_backoff_capped() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(10);
        assert_eq!(task_backoff(base, 4, cap), Duration::from_secs(10));
        assert_eq!(task_backoff(base, 40, cap), Duration::from_secs(10));
        assert_eq!(task_backoff(base, u32::MAX, cap), Duration::from_secs(10));
    }

    #[test]
    fn test_task_backoff_non_decreasing() {
        let base = Duration::from_millis(150);
        let cap = Duration::from_secs(60);
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = task_backoff(base, attempt, cap);
            assert!(delay >= previous, "attempt {} went backwards", attempt);
            previous = delay;
        }
    }

    #[test]
    fn test_task_backoff_zero_base() {
        assert_eq!(
            task_backoff(Duration::ZERO, 5, Duration::from_secs(1)),
            Duration::ZERO
        );
    }

    // ========================================================================
    // Store retry policy
    // ========================================================================

    #[test]
    fn test_retry_policy_none() {
        let policy = RetryPolicy::none();
        assert!(!policy.should_retry(0));
        assert_eq!(policy.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::exponential(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_delay_for_attempt_exponential() {
        let policy = RetryPolicy::exponential(5);
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_for_attempt_fixed() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(2));
    }

    #[test]
    fn test_delay_respects_max() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(5000), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_serialization() {
        let policy = RetryPolicy::exponential(3);
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["initial_delay"], serde_json::json!(100));
        let parsed: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, policy);
    }
}
