use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential retry backoff: `base * 2^retry`, capped at `max`, plus up to
/// `jitter` of random delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, jitter_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            jitter_ms,
        }
    }

    /// Delay without jitter before retry number `retry` (0-based).
    pub fn base_delay(&self, retry: u32) -> Duration {
        // 2^63 already overflows any realistic base, so clamp the shift.
        let factor = 1u64 << retry.min(63);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delay before retry number `retry` (0-based), jitter included.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.base_delay(retry) + Duration::from_millis(jitter)
    }

    /// Delay after a job has used `attempts` attempts (1-based).
    pub fn delay_after_attempt(&self, attempts: u32) -> Duration {
        self.delay_for(attempts.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles() {
        let policy = RetryPolicy::new(100, 10_000, 0);
        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay(5), Duration::from_millis(3_200));
    }

    #[test]
    fn base_delay_is_capped() {
        let policy = RetryPolicy::new(100, 1_000, 0);
        assert_eq!(policy.base_delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay(40), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = RetryPolicy::new(100, 10_000, 50);
        for retry in 0..6 {
            let base = policy.base_delay(retry);
            for _ in 0..50 {
                let d = policy.delay_for(retry);
                assert!(d >= base);
                assert!(d <= base + Duration::from_millis(50));
            }
        }
    }

    #[test]
    fn delays_are_non_decreasing_modulo_jitter() {
        let policy = RetryPolicy::new(50, 5_000, 20);
        let jitter = Duration::from_millis(policy.jitter_ms);
        let mut previous = Duration::ZERO;
        for attempts in 1..12 {
            let d = policy.delay_after_attempt(attempts);
            assert!(d + jitter >= previous, "attempt {attempts}: {d:?} < {previous:?}");
            previous = d;
        }
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_ms, 500);
        assert_eq!(policy.max_delay_ms, 30_000);
        assert_eq!(policy.jitter_ms, 100);
    }
}
