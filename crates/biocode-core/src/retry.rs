//! Capped exponential backoff
//!
//! One policy type drives both source reconnects and registry submissions.
//! The policy only computes delays; callers own the sleeping.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt, in milliseconds
    pub initial_delay_ms: u64,
    /// Growth factor applied after every failed attempt
    pub multiplier: f64,
    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Total attempts including the first
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Reconnect policy for the image source: 2 s, x1.5, capped at 30 s, 30 attempts
    #[inline]
    #[must_use]
    pub const fn connection() -> Self {
        Self {
            initial_delay_ms: 2_000,
            multiplier: 1.5,
            max_delay_ms: 30_000,
            max_attempts: 30,
        }
    }

    /// Submission policy for the registry: 500 ms, x2, capped at 5 s, 3 attempts
    #[inline]
    #[must_use]
    pub const fn submission() -> Self {
        Self {
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            max_attempts: 3,
        }
    }

    /// Single attempt, no waiting
    #[inline]
    #[must_use]
    pub const fn none() -> Self {
        Self {
            initial_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            max_attempts: 1,
        }
    }

    /// With a different attempt budget
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// With different delays
    #[inline]
    #[must_use]
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay_ms = u64::try_from(initial.as_millis()).unwrap_or(u64::MAX);
        self.max_delay_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Delay to wait after the failed attempt numbered `attempt` (0-based)
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts
    #[inline]
    #[must_use]
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// The delays between consecutive attempts, `max_attempts - 1` of them
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(move |a| self.delay_after(a))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::connection()
    }
}
