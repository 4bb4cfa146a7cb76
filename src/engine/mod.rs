//! Worker engine: claim loop, retry policy, recurrence expansion.

pub mod dispatcher;
pub mod recurrence;
pub mod retry;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use recurrence::RecurrenceExpander;
pub use retry::RetryPolicy;
pub use worker::Worker;

use std::time::Duration;

/// Why one execution attempt failed.
///
/// Action failures never escape the dispatcher as errors; they are
/// classified here and handed to the [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Failure {
    /// The action returned an error.
    #[error("{0}")]
    Action(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("panicked: {0}")]
    Panicked(String),

    /// No handler is registered under the task's action name.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// The action declared the failure permanent.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl Failure {
    /// Whether another attempt could succeed. Misconfiguration and declared
    /// permanent failures abandon the task immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Failure::UnknownAction(_) | Failure::Permanent(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Failure::Action(_) => "action",
            Failure::TimedOut(_) => "timeout",
            Failure::Panicked(_) => "panic",
            Failure::UnknownAction(_) => "unknown_action",
            Failure::Permanent(_) => "permanent",
        }
    }
}

/// Backoff after `failures` consecutive store errors in a worker loop:
/// doubles from `base`, capped at `max`.
pub(crate) fn error_backoff(base: Duration, failures: u32, max: Duration) -> Duration {
    let base = base.max(Duration::from_millis(100));
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(max)
}
