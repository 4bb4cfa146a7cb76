//! Retry policy: decides what happens to a task after a failed attempt.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng as _;

use super::Failure;
use crate::config::RetryConfig;
use crate::model::task::Task;
use crate::store::Transition;

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the next attempt, without jitter.
    ///
    /// `attempts` is the number of attempts already made (1-based):
    /// `base_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    ///
    /// With base_delay=5s, multiplier=2.0:
    /// - attempt 1 (first failure): 5s
    /// - attempt 2: 10s
    /// - attempt 3: 20s
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.config.base_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        // `min` also absorbs overflow to infinity.
        let capped = secs.min(self.config.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.config.max_delay)
    }

    /// [`Self::backoff`] spread by up to `jitter` of itself in either
    /// direction, never above `max_delay`.
    pub fn delay(&self, attempts: u32) -> Duration {
        let base = self.backoff(attempts);
        let jitter = self.config.jitter;
        if jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(factor.max(0.0)).min(self.config.max_delay)
    }

    /// Outcome for `task` after its latest attempt failed with `failure`.
    ///
    /// `task.attempts` already counts the failed attempt. Tasks with
    /// attempts left go back to pending after the backoff; the rest, and
    /// any failure that is not retryable, are abandoned.
    pub fn decide(&self, task: &Task, failure: &Failure, now: DateTime<Utc>) -> Transition {
        if !failure.is_retryable() || task.attempts >= task.max_attempts {
            return Transition::Abandon;
        }

        let scheduled_for = chrono::Duration::from_std(self.delay(task.attempts))
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Transition::Retry { scheduled_for }
    }
}
