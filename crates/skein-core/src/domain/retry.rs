//! Retry policy: decides backoff delays.
//!
//! Used twice: for task-level retries after a handler failure, and inside the store
//! for bounded retries of transient storage errors.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with an upper bound and optional positive jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Growth factor per retry. Must be >= 1.
    pub multiplier: f64,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Fraction of the delay added at random, `0.0..=multiplier - 1.0`.
    ///
    /// Staying within that range keeps successive delays non-decreasing.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier: 2.0,
            max_delay: Duration::from_secs(60 * 60),
            jitter: 0.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry_count + 1`, without jitter.
    ///
    /// `base_delay * multiplier^retry_count`, capped at `max_delay`.
    ///
    /// Example with base_delay=2s, multiplier=2.0:
    /// - retry_count 0 (first failure): 2s
    /// - retry_count 1: 4s
    /// - retry_count 2: 8s
    pub fn nominal_delay(&self, retry_count: u32) -> Duration {
        self.scaled(retry_count, 1.0)
    }

    /// Delay before retry number `retry_count + 1`, jitter included.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let factor = if self.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            1.0
        };
        self.scaled(retry_count, factor)
    }

    fn scaled(&self, retry_count: u32, factor: f64) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent) * factor;
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(30));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.jitter, 0.0);
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 4)]
    #[case(2, 8)]
    #[case(3, 16)]
    fn exponential_backoff_doubles(#[case] retry_count: u32, #[case] secs: u64) {
        let policy = RetryPolicy::new(Duration::from_secs(2));
        assert_eq!(policy.next_delay(retry_count), Duration::from_secs(secs));
    }

    #[test]
    fn delays_are_capped() {
        let policy =
            RetryPolicy::new(Duration::from_secs(2)).with_max_delay(Duration::from_secs(10));
        assert_eq!(policy.next_delay(3), Duration::from_secs(10));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn jittered_delays_never_shrink() {
        let policy = RetryPolicy::new(Duration::from_millis(100))
            .with_jitter(0.9)
            .with_max_delay(Duration::from_secs(5));

        for _ in 0..50 {
            let mut previous = Duration::ZERO;
            for retry_count in 0..12 {
                let delay = policy.next_delay(retry_count);
                assert!(delay >= previous, "{delay:?} < {previous:?} at {retry_count}");
                assert!(delay >= policy.nominal_delay(retry_count));
                previous = delay;
            }
        }
    }
}
