//! Retry policy - exponential backoff with jitter

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use relayq_common::config::RetryConfig;

/// Backoff policy applied between delivery attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: i32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter: f64,
}

impl RetryPolicy {
    /// Create a policy from configuration
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter: config.jitter,
        }
    }

    /// Attempt budget before a failure becomes a dead letter
    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `retry_count` failures
    pub fn allows_retry(&self, retry_count: i32) -> bool {
        retry_count < self.max_attempts
    }

    /// Delay before attempt number `attempt` (1-indexed, so the first
    /// retry is attempt 1)
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let delay_ms = calculate_backoff_ms(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter,
        );
        Duration::milliseconds(delay_ms as i64)
    }

    /// Timestamp of the next attempt
    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt: i32) -> DateTime<Utc> {
        now + self.delay_for(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

/// Calculate a backoff delay in milliseconds.
///
/// `delay = min(base * 2^(attempt - 1), max) * (1 ± jitter)`, clamped
/// to `max` after jitter so the ceiling always holds.
fn calculate_backoff_ms(attempt: i32, base_ms: u64, max_ms: u64, jitter: f64) -> u64 {
    let exponent = attempt.saturating_sub(1).clamp(0, 62) as u32;
    let delay = base_ms.saturating_mul(1u64 << exponent).min(max_ms);

    if jitter <= 0.0 {
        return delay;
    }

    let jitter_range = (delay as f64) * jitter;
    let offset: f64 = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    let jittered = ((delay as f64) + offset).max(0.0) as u64;
    jittered.min(max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter,
        })
    }

    #[test]
    fn test_backoff_doubles_without_jitter() {
        let policy = policy(0.0);
        assert_eq!(policy.delay_for(1), Duration::milliseconds(1_000));
        assert_eq!(policy.delay_for(2), Duration::milliseconds(2_000));
        assert_eq!(policy.delay_for(3), Duration::milliseconds(4_000));
        assert_eq!(policy.delay_for(4), Duration::milliseconds(8_000));
    }

    #[test]
    fn test_backoff_caps_at_max_delay() {
        let policy = policy(0.0);
        assert_eq!(policy.delay_for(7), Duration::milliseconds(60_000));
        assert_eq!(policy.delay_for(100), Duration::milliseconds(60_000));
        assert_eq!(policy.delay_for(i32::MAX), Duration::milliseconds(60_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        for attempt in 1..=4 {
            let expected = 1_000u64 << (attempt - 1);
            let min = (expected as f64 * 0.9) as i64;
            let max = (expected as f64 * 1.1) as i64;
            for _ in 0..50 {
                let delay = policy(0.1).delay_for(attempt).num_milliseconds();
                assert!(
                    delay >= min && delay <= max,
                    "delay {} outside [{}, {}]",
                    delay,
                    min,
                    max
                );
            }
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max_delay() {
        let policy = policy(0.5);
        for _ in 0..100 {
            assert!(policy.delay_for(100).num_milliseconds() <= 60_000);
        }
    }

    #[test]
    fn test_jitter_produces_spread() {
        let policy = policy(0.1);
        let first = policy.delay_for(3);
        let distinct = (0..50).any(|_| policy.delay_for(3) != first);
        assert!(distinct, "fifty jittered samples never varied");
    }

    #[test]
    fn test_allows_retry_under_budget() {
        let policy = policy(0.0);
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
    }

    #[test]
    fn test_next_attempt_at_offsets_from_now() {
        let policy = policy(0.0);
        let now = Utc::now();
        assert_eq!(policy.next_attempt_at(now, 2), now + Duration::milliseconds(2_000));
    }
}
