//! Bounded retry policy for establishing the broker connection.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of connection attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Default pause between two connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// How long to wait between two consecutive connection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// The same delay after every failed attempt.
    Fixed(Duration),
    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

/// Configuration for connection attempts.
///
/// This is a plain value: nothing here sleeps or talks to the network, so tests can
/// inject zero delays and check the schedule directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Creates a new retry policy.
    ///
    /// # Arguments
    /// * `max_attempts` - Total number of attempts, including the first one. Clamped to at least 1.
    /// * `backoff` - Delay strategy applied after each failed attempt.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Fixed delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Backoff::Fixed(delay))
    }

    /// Exponential backoff doubling from `initial` up to `max`.
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self::new(
            max_attempts,
            Backoff::Exponential {
                initial,
                multiplier: 2.0,
                max,
            },
        )
    }

    /// Retries back to back. Only useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    /// Returns the delay to wait after the failed attempt number `attempt` (1-based).
    /// Returns `None` once the attempt budget is spent, i.e. no further attempt follows.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }

        let delay = match &self.backoff {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let factor = multiplier.max(1.0).powi((attempt - 1) as i32);
                let secs = initial.as_secs_f64() * factor;
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        };
        Some(delay)
    }

    /// Checks whether another attempt is allowed after `attempt` attempts have been made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 20);
        assert_eq!(policy.backoff, Backoff::Fixed(Duration::from_secs(3)));
    }

    #[test]
    fn test_fixed_delay_until_budget_spent() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_millis(250)));
        // No sleep after the final attempt.
        assert_eq!(policy.delay_after(3), None);
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_after(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_after(4), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_after(9), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_after(10), None);
    }

    #[test]
    fn test_exponential_keeps_sub_millisecond_delays() {
        let policy = RetryPolicy::exponential(5, Duration::from_micros(500), Duration::from_secs(1));
        let first = policy.delay_after(1).unwrap();
        let second = policy.delay_after(2).unwrap();
        assert!(first > Duration::from_micros(499) && first <= Duration::from_micros(500));
        assert!(second > Duration::from_micros(999) && second <= Duration::from_millis(1));
    }

    #[test]
    fn test_zero_attempts_is_clamped_to_one() {
        let policy = RetryPolicy::immediate(0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay_after(1), None);
    }
}
