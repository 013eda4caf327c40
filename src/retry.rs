//! Retry policy with exponential backoff
//!
//! Transient transfer failures are retried with exponentially increasing
//! delays and optional jitter to prevent thundering herd. The policy only
//! computes delays; the queue applies them as non-blocking scheduled
//! re-entry (the task goes back to pending with a not-before instant and a
//! timer wakes the pool), so a retrying task never occupies a worker slot
//! while it waits.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Computes whether and when a failed attempt should be retried
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from a retry configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Maximum number of retries after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Delay before re-dispatching after the given failed attempt (1-based)
    ///
    /// Returns `None` once retries are exhausted, i.e. a task is attempted
    /// exactly `max_retries + 1` times in total. The delay grows as
    /// `initial_delay * multiplier^(attempt-1)`, capped at `max_delay`,
    /// with optional uniform jitter on top (actual delay between 1x and 2x
    /// the computed value).
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.config.max_retries {
            return None;
        }

        let exponent = attempt.saturating_sub(1);
        let factor = self.config.backoff_multiplier.powi(exponent as i32);
        let raw = Duration::from_secs_f64(self.config.initial_delay.as_secs_f64() * factor);
        let capped = raw.min(self.config.max_delay);

        if self.config.jitter {
            Some(add_jitter(capped))
        } else {
            Some(capped)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay,
/// so the actual delay is between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, initial_ms: u64, max_ms: u64, multiplier: f64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_multiplier: multiplier,
            jitter: false,
        })
    }

    #[test]
    fn delays_grow_exponentially_without_jitter() {
        let policy = policy(5, 100, 60_000, 2.0);

        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_millis(800)));
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let policy = policy(10, 100, 300, 10.0);

        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        // 100 * 10 = 1000ms, capped to 300ms
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(300)));
        assert_eq!(policy.next_delay(5), Some(Duration::from_millis(300)));
    }

    #[test]
    fn exhausted_after_max_retries() {
        let policy = policy(3, 10, 1_000, 2.0);

        assert!(policy.next_delay(1).is_some());
        assert!(policy.next_delay(2).is_some());
        assert!(policy.next_delay(3).is_some());
        assert!(
            policy.next_delay(4).is_none(),
            "attempt 4 exceeds max_retries=3, so total attempts = 4 = max_retries + 1"
        );
    }

    #[test]
    fn zero_max_retries_never_retries() {
        let policy = policy(0, 10, 1_000, 2.0);
        assert!(
            policy.next_delay(1).is_none(),
            "first failure must be final when max_retries=0"
        );
    }

    #[test]
    fn jitter_stays_within_bounds_over_many_iterations() {
        let delay = Duration::from_millis(50);
        for i in 0..200 {
            let jittered = add_jitter(delay);
            assert!(
                jittered >= delay,
                "iteration {i}: jittered {jittered:?} < base delay {delay:?}"
            );
            assert!(
                jittered <= delay * 2,
                "iteration {i}: jittered {jittered:?} > 2x base delay"
            );
        }
    }

    #[test]
    fn jitter_on_zero_delay_returns_zero() {
        assert_eq!(add_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn jittered_delay_stays_between_base_and_double() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        });

        for _ in 0..50 {
            let delay = policy.next_delay(2).unwrap();
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }
}
