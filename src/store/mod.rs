//! Task record store: the durable tables and the atomic claim operation.
//!
//! [`TaskStore`] is the only shared mutable resource between workers.
//! Dispatchers and expanders receive it as an injected `Arc<dyn TaskStore>`;
//! [`crate::db::Db`] is the Postgres implementation, [`MemoryStore`] the
//! in-process one used by tests and embedded setups.
//!
//! Every mutation of lock fields goes through an operation that is atomic
//! with respect to all other callers. Implementations must never
//! read-then-write a task's lock fields.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::model::recurring::{
    Interval, NewRecurringTask, RecurringTaskDefinition, RecurringTaskId, RecurringTaskRun,
};
use crate::model::task::{NewTask, Task, TaskId, TaskRun, TaskState, stale_horizon};
use crate::telemetry::metrics;

/// Parameters of one claim: `ClaimBatch(worker_id, batch_size, now)` plus
/// the stale-lock horizon.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub worker_id: String,
    pub batch_size: usize,
    pub now: DateTime<Utc>,
    pub lock_timeout: chrono::Duration,
}

impl ClaimRequest {
    /// Locks taken before this instant are stale.
    pub fn stale_before(&self) -> DateTime<Utc> {
        stale_horizon(self.now, self.lock_timeout)
    }
}

/// A task now locked by the claiming worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: Task,
    /// Previous holder when this claim reclaimed a stale lock.
    pub reclaimed_from: Option<String>,
}

/// Outcome written back for a locked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `LOCKED -> SUCCESS`.
    Succeed,
    /// `LOCKED -> PENDING`, eligible again at `scheduled_for`.
    Retry { scheduled_for: DateTime<Utc> },
    /// `LOCKED -> ABANDONED`.
    Abandon,
}

impl Transition {
    pub fn target_state(&self) -> TaskState {
        match self {
            Transition::Succeed => TaskState::Success,
            Transition::Retry { .. } => TaskState::Pending,
            Transition::Abandon => TaskState::Abandoned,
        }
    }
}

/// Parameters of one expander pass.
#[derive(Debug, Clone)]
pub struct ExpandRequest {
    /// Identity recorded in `locked_by` of claimed definitions.
    pub holder: String,
    pub now: DateTime<Utc>,
    pub lock_timeout: chrono::Duration,
    pub limit: usize,
}

impl ExpandRequest {
    /// Definition locks taken before this instant are stale.
    pub fn stale_before(&self) -> DateTime<Utc> {
        stale_horizon(self.now, self.lock_timeout)
    }
}

/// Listing filter for operators.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub action_name: Option<String>,
    pub limit: Option<usize>,
}

/// Number of tasks per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub locked: u64,
    pub success: u64,
    pub failed: u64,
    pub abandoned: u64,
}

impl QueueCounts {
    pub(crate) fn add(&mut self, state: TaskState, n: u64) {
        match state {
            TaskState::Pending => self.pending += n,
            TaskState::Locked => self.locked += n,
            TaskState::Success => self.success += n,
            TaskState::Failed => self.failed += n,
            TaskState::Abandoned => self.abandoned += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.locked + self.success + self.failed + self.abandoned
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    // -- Tasks ---------------------------------------------------------------

    /// Insert a new pending task created at `now`.
    async fn enqueue(&self, new: NewTask, now: DateTime<Utc>) -> Result<TaskId>;

    async fn get_task(&self, id: TaskId) -> Result<Task>;

    /// Tasks matching `filter`, newest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    async fn counts(&self) -> Result<QueueCounts>;

    /// Atomically select up to `batch_size` eligible tasks and lock them for
    /// `worker_id`, returned in selection order.
    ///
    /// Eligible: pending with `scheduled_for <= now`, or locked with
    /// `locked_at < now - lock_timeout` and attempts left. Stale locks on
    /// tasks with no attempts left are abandoned in the same operation.
    /// Concurrent calls never return the same task.
    async fn claim_batch(&self, req: &ClaimRequest) -> Result<Vec<ClaimedTask>>;

    /// Apply `transition` to a task still locked by `run.worker_id` and
    /// record `run`, atomically. [`crate::error::Error::LockLost`] when the
    /// lock is no longer held.
    async fn resolve(&self, run: &TaskRun, transition: Transition) -> Result<Task>;

    /// Run history of a task, oldest first.
    async fn task_runs(&self, id: TaskId) -> Result<Vec<TaskRun>>;

    /// Delete successful tasks created before `before`, with their runs.
    /// Abandoned tasks are kept for inspection.
    async fn purge_succeeded(&self, before: DateTime<Utc>) -> Result<u64>;

    // -- Recurring definitions -----------------------------------------------

    async fn create_recurring(
        &self,
        new: NewRecurringTask,
        now: DateTime<Utc>,
    ) -> Result<RecurringTaskId>;

    async fn get_recurring(&self, id: RecurringTaskId) -> Result<RecurringTaskDefinition>;

    async fn list_recurring(&self) -> Result<Vec<RecurringTaskDefinition>>;

    /// Disabling halts expansion; history is kept.
    async fn set_recurring_enabled(
        &self,
        id: RecurringTaskId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<RecurringTaskDefinition>;

    /// Change the interval and recompute the next due time from `last_run`.
    async fn set_recurring_interval(
        &self,
        id: RecurringTaskId,
        interval: Interval,
        now: DateTime<Utc>,
    ) -> Result<RecurringTaskDefinition>;

    /// Atomically set `is_locked` on up to `limit` enabled, due definitions
    /// that are unlocked or whose lock is stale, and return them.
    async fn lock_due_recurring(&self, req: &ExpandRequest) -> Result<Vec<RecurringTaskDefinition>>;

    /// Spawn the task for a definition locked by `holder`, record the run,
    /// advance `last_run`/`next_run_at` and release the lock, atomically.
    /// `None` (lock released, nothing spawned) when the definition was
    /// disabled since it was locked.
    async fn materialize_recurring(
        &self,
        id: RecurringTaskId,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskId>>;

    /// Release a definition lock held by `holder` without firing.
    async fn release_recurring(&self, id: RecurringTaskId, holder: &str) -> Result<()>;

    /// Materialization history, oldest first.
    async fn recurring_runs(&self, id: RecurringTaskId) -> Result<Vec<RecurringTaskRun>>;

    async fn health_check(&self) -> Result<()>;
}

/// Enqueue a task now, with producer-side logging and metrics.
pub async fn submit(store: &dyn TaskStore, new: NewTask) -> Result<TaskId> {
    let action = new.action_name().to_string();
    let id = store.enqueue(new, Utc::now()).await?;
    metrics::task_enqueued().add(1, &[KeyValue::new("action", action.clone())]);
    info!(task_id = %id, action = %action, "task enqueued");
    Ok(id)
}
