//! Tasks, their lifecycle state, and per-attempt run history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Attempts allowed when a submitter does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A single schedulable, lockable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Name of the registered action that executes this task.
    pub action_name: String,

    /// Arguments handed to the action. Opaque to the queue.
    pub args: serde_json::Value,

    pub state: TaskState,

    /// Higher = claimed first.
    pub priority: i32,

    /// Earliest time the task is eligible for claim.
    pub scheduled_for: DateTime<Utc>,

    /// Claims so far, including the one currently holding the lock.
    pub attempts: u32,
    pub max_attempts: u32,

    /// Worker holding the lock. Set iff `state == Locked`.
    pub locked_by: Option<String>,
    /// When the lock was taken. Set iff `state == Locked`.
    pub locked_at: Option<DateTime<Utc>>,

    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Eligible for claim at `now`: pending and due, or locked with a lock
    /// older than `lock_timeout` that still has attempts left.
    pub fn is_claimable(&self, now: DateTime<Utc>, lock_timeout: chrono::Duration) -> bool {
        match self.state {
            TaskState::Pending => self.scheduled_for <= now,
            TaskState::Locked => {
                self.has_stale_lock(now, lock_timeout) && self.attempts < self.max_attempts
            }
            _ => false,
        }
    }

    /// Locked, and the lock is older than `lock_timeout`.
    pub fn has_stale_lock(&self, now: DateTime<Utc>, lock_timeout: chrono::Duration) -> bool {
        self.state == TaskState::Locked
            && self.locked_at.is_some_and(|at| at < stale_horizon(now, lock_timeout))
    }

    /// Selection order key: priority descending, then `scheduled_for`,
    /// `created_at` and id ascending.
    pub fn claim_order(&self) -> (std::cmp::Reverse<i32>, DateTime<Utc>, DateTime<Utc>, TaskId) {
        (
            std::cmp::Reverse(self.priority),
            self.scheduled_for,
            self.created_at,
            self.id,
        )
    }
}

/// Locks taken before this instant are stale. Saturates at the earliest
/// representable time, before which no lock can have been taken.
pub fn stale_horizon(now: DateTime<Utc>, lock_timeout: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(lock_timeout)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Newtype for task IDs. Time-ordered (UUIDv7), so ids also break ties in
/// creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Last 8 hex digits. The leading digits of a v7 id are timestamp bits
    /// shared by every task created in the same minute; the tail is random.
    pub fn short(&self) -> String {
        let hex = self.0.simple().to_string();
        hex[hex.len() - 8..].to_string()
    }

    /// True when `abbrev` is a suffix of this id, with or without hyphens.
    pub fn matches_short(&self, abbrev: &str) -> bool {
        let abbrev = abbrev.trim().replace('-', "").to_ascii_lowercase();
        !abbrev.is_empty() && self.0.simple().to_string().ends_with(&abbrev)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidTask(format!("bad task id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for `scheduled_for` and a worker.
    Pending,
    /// Claimed by a worker, executing.
    Locked,
    /// Action succeeded. Terminal.
    Success,
    /// Failed attempt awaiting a retry decision. The queue resolves failures
    /// in the same write that records them, so rows only rest here when
    /// written by external tooling. Never claimed.
    Failed,
    /// Retries exhausted, unknown action, or permanent failure. Terminal.
    Abandoned,
}

impl TaskState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Pending, Locked)
                | (Locked, Locked)     // stale lock reclaimed by another worker
                | (Locked, Success)
                | (Locked, Pending)    // retry
                | (Locked, Failed)
                | (Locked, Abandoned)
                | (Failed, Pending)
                | (Failed, Abandoned)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Abandoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Locked => "locked",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "locked" => Ok(TaskState::Locked),
            "success" => Ok(TaskState::Success),
            "failed" => Ok(TaskState::Failed),
            "abandoned" => Ok(TaskState::Abandoned),
            other => Err(Error::Other(format!("unknown task state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Run history
// ---------------------------------------------------------------------------

/// One resolved attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: TaskId,
    pub worker_id: String,
    /// Attempt number this run corresponds to (1-based).
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: RunResult,
    pub error: Option<String>,
}

impl TaskRun {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Success,
    Failure,
}

impl RunResult {
    pub fn as_str(self) -> &'static str {
        match self {
            RunResult::Success => "success",
            RunResult::Failure => "failure",
        }
    }
}

impl std::fmt::Display for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunResult {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(RunResult::Success),
            "failure" => Ok(RunResult::Failure),
            other => Err(Error::Other(format!("unknown run result: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for submitting tasks. `Enqueue(action, args, scheduled_for?,
/// priority?, max_attempts?)`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) action_name: String,
    pub(crate) args: serde_json::Value,
    pub(crate) scheduled_for: Option<DateTime<Utc>>,
    pub(crate) priority: i32,
    pub(crate) max_attempts: u32,
}

impl NewTask {
    pub fn new(action_name: impl Into<String>) -> Self {
        Self {
            action_name: action_name.into(),
            args: serde_json::Value::Null,
            scheduled_for: None,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    /// Not eligible before `at`. Defaults to the enqueue time.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
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

    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    /// Validate and materialize into a pending task created at `now`.
    pub fn into_task(self, now: DateTime<Utc>) -> Result<Task> {
        if self.action_name.trim().is_empty() {
            return Err(Error::InvalidTask("action name must not be empty".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::InvalidTask("max_attempts must be at least 1".to_string()));
        }
        Ok(Task {
            id: TaskId::new(),
            action_name: self.action_name,
            args: self.args,
            state: TaskState::Pending,
            priority: self.priority,
            scheduled_for: self.scheduled_for.unwrap_or(now),
            attempts: 0,
            max_attempts: self.max_attempts,
            locked_by: None,
            locked_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }
}
