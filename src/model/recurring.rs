//! Recurring task definitions and their materialization history.

use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::task::{DEFAULT_MAX_ATTEMPTS, TaskId, stale_horizon};

/// A template that spawns a concrete task every `interval`.
///
/// Has no execution state of its own. `is_locked` is the definition-level
/// mutual exclusion flag held by an expander while it materializes a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringTaskDefinition {
    pub id: RecurringTaskId,
    pub action_name: String,
    pub args: serde_json::Value,
    pub interval: Interval,
    pub enabled: bool,

    /// Priority and attempt limit given to spawned tasks.
    pub priority: i32,
    pub max_attempts: u32,

    pub is_locked: bool,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,

    /// Most recent materialization.
    pub last_run: Option<DateTime<Utc>>,
    /// Derived from `last_run` and `interval`; due when `next_run_at <= now`.
    pub next_run_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringTaskDefinition {
    /// Enabled, due, and not held by a live expander.
    pub fn is_expandable(&self, now: DateTime<Utc>, lock_timeout: chrono::Duration) -> bool {
        let lock_free = !self.is_locked
            || self.locked_at.is_none_or(|at| at < stale_horizon(now, lock_timeout));
        self.enabled && lock_free && self.next_run_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecurringTaskId(pub Uuid);

impl RecurringTaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RecurringTaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecurringTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecurringTaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidTask(format!("bad recurring task id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

/// How often a definition fires: a fixed period or a 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Interval {
    Every {
        #[serde(with = "secs")]
        period: Duration,
    },
    Cron {
        expression: String,
    },
}

/// Longest fixed period a definition may use.
pub const MAX_PERIOD: Duration = Duration::from_secs(10 * 366 * 24 * 60 * 60);

impl Interval {
    /// A fixed period of whole seconds, at most [`MAX_PERIOD`].
    pub fn every(period: Duration) -> Result<Self> {
        let interval = Interval::Every { period };
        interval.validate()?;
        Ok(interval)
    }

    pub fn cron(expression: impl Into<String>) -> Result<Self> {
        let expression = expression.into();
        parse_cron(&expression)?;
        Ok(Interval::Cron { expression })
    }

    /// Checks an interval built directly from its variant or deserialized.
    pub fn validate(&self) -> Result<()> {
        match self {
            Interval::Every { period } => {
                if period.is_zero() {
                    return Err(Error::InvalidTask("interval must be positive".to_string()));
                }
                if period.subsec_nanos() != 0 {
                    return Err(Error::InvalidTask(format!(
                        "interval must be whole seconds, got {period:?}"
                    )));
                }
                if *period > MAX_PERIOD {
                    return Err(Error::InvalidTask(format!(
                        "interval of {}s exceeds the maximum of {}s",
                        period.as_secs(),
                        MAX_PERIOD.as_secs()
                    )));
                }
                Ok(())
            }
            Interval::Cron { expression } => parse_cron(expression).map(|_| ()),
        }
    }

    /// First time a definition created at `now` becomes due.
    pub fn first_due(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Interval::Every { .. } => Ok(now),
            Interval::Cron { .. } => self.next_after(now),
        }
    }

    /// Next firing strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Interval::Every { period } => {
                let period = chrono::Duration::from_std(*period)
                    .map_err(|e| Error::InvalidTask(format!("interval out of range: {e}")))?;
                from.checked_add_signed(period).ok_or_else(|| {
                    Error::InvalidTask(format!("next run after {from} is out of range"))
                })
            }
            Interval::Cron { expression } => parse_cron(expression)?
                .find_next_occurrence(&from, false)
                .map_err(|e| Error::InvalidTask(format!("cron {expression:?}: {e}"))),
        }
    }

    /// Due time given the last materialization, or the first due time when
    /// the definition never ran.
    pub fn due_after(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match last_run {
            Some(last) => self.next_after(last),
            None => self.first_due(now),
        }
    }
}

fn parse_cron(expression: &str) -> Result<Cron> {
    Cron::new(expression)
        .parse()
        .map_err(|e| Error::InvalidTask(format!("bad cron expression {expression:?}: {e}")))
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interval::Every { period } => write!(f, "every {}s", period.as_secs()),
            Interval::Cron { expression } => write!(f, "cron {expression}"),
        }
    }
}

/// Parses `90`, `90s`, `15m`, `2h`, `1d`, or `cron:<expression>`.
impl std::str::FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(expression) = s.strip_prefix("cron:") {
            return Interval::cron(expression.trim());
        }
        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(i) => s.split_at(i),
            None => (s, "s"),
        };
        let n: u64 = digits
            .parse()
            .map_err(|_| Error::InvalidTask(format!("bad interval {s:?}")))?;
        let unit_secs: u64 = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 24 * 60 * 60,
            other => return Err(Error::InvalidTask(format!("bad interval unit {other:?}"))),
        };
        let secs = n
            .checked_mul(unit_secs)
            .ok_or_else(|| Error::InvalidTask(format!("interval {s:?} is too large")))?;
        Interval::every(Duration::from_secs(secs))
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// Run history
// ---------------------------------------------------------------------------

/// One materialization of a definition into a concrete task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringTaskRun {
    pub definition_id: RecurringTaskId,
    pub task_id: TaskId,
    pub fired_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for creating recurring definitions.
#[derive(Debug, Clone)]
pub struct NewRecurringTask {
    pub(crate) action_name: String,
    pub(crate) args: serde_json::Value,
    pub(crate) interval: Interval,
    pub(crate) priority: i32,
    pub(crate) max_attempts: u32,
    pub(crate) enabled: bool,
}

impl NewRecurringTask {
    pub fn new(action_name: impl Into<String>, interval: Interval) -> Self {
        Self {
            action_name: action_name.into(),
            args: serde_json::Value::Null,
            interval,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            enabled: true,
        }
    }

    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn into_definition(self, now: DateTime<Utc>) -> Result<RecurringTaskDefinition> {
        if self.action_name.trim().is_empty() {
            return Err(Error::InvalidTask("action name must not be empty".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::InvalidTask("max_attempts must be at least 1".to_string()));
        }
        self.interval.validate()?;
        let next_run_at = self.interval.first_due(now)?;
        Ok(RecurringTaskDefinition {
            id: RecurringTaskId::new(),
            action_name: self.action_name,
            args: self.args,
            interval: self.interval,
            enabled: self.enabled,
            priority: self.priority,
            max_attempts: self.max_attempts,
            is_locked: false,
            locked_by: None,
            locked_at: None,
            last_run: None,
            next_run_at,
            created_at: now,
            updated_at: now,
        })
    }
}
