//! Reconnect backoff.
//!
//! Attempts are unbounded; only the spacing between them is policy.
//! Delay `n` is `min(initial * multiplier^n, max)`, optionally with equal
//! jitter (half fixed, half uniformly random) so many processes losing the
//! same broker do not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Randomize the upper half of each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Stateful delay generator for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Failures since the last `reset()`.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Forgets past failures after a successful cycle.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns the delay before the next attempt and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if !self.policy.jitter || base.is_zero() {
            return base;
        }
        let half = base / 2;
        #[allow(clippy::cast_possible_truncation)]
        let spread_ms = (base - half).as_millis() as u64;
        half + Duration::from_millis(rand::rng().random_range(0..=spread_ms))
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let max = self.policy.max_backoff;
        let factor = self.policy.multiplier.max(1.0).powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        #[allow(clippy::cast_precision_loss)]
        let scaled_ns = self.policy.initial_backoff.as_nanos() as f64 * factor;
        #[allow(clippy::cast_precision_loss)]
        let max_ns = max.as_nanos() as f64;
        if !scaled_ns.is_finite() || scaled_ns >= max_ns {
            max
        } else {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let nanos = scaled_ns as u64;
            Duration::from_nanos(nanos)
        }
    }
}
