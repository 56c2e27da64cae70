//! Exponential backoff with a cap, an attempt ceiling and optional jitter.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay, `Retry-After` hints included.
    pub max_delay: Duration,
    /// Attempt ceiling used when the caller does not supply one.
    pub max_attempts: u32,
    /// Randomly shave up to half off each delay.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Unjittered delay after failed attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max_delay)`. Non-decreasing in `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        let base = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let cap = self.max_delay.as_millis().min(u64::MAX as u128) as u64;
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).min(cap))
    }

    /// Apply jitter: a uniform reduction of up to 50%.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        delay.mul_f64(factor)
    }

    /// How long to wait after failed attempt `attempt` before trying again.
    ///
    /// Returns `None` once `attempt` has reached the ceiling (the caller's
    /// `ceiling`, or [`max_attempts`](Self::max_attempts)); no further attempt
    /// is scheduled. An upstream `retry_after` hint replaces the computed
    /// delay and is still capped by `max_delay`.
    pub fn next_delay(
        &self,
        attempt: u32,
        ceiling: Option<u32>,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        let ceiling = ceiling.unwrap_or(self.max_attempts);
        if attempt >= ceiling {
            return None;
        }
        Some(match retry_after {
            Some(hint) => hint.min(self.max_delay),
            None => self.jittered(self.delay(attempt)),
        })
    }
}
