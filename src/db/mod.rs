//! Postgres store: connection pool, migrations, health check.
//!
//! All queue state lives in the `task`, `task_run`,
//! `recurring_task_definition` and `recurring_task_run` tables. Claims use
//! row-level locks with `FOR UPDATE SKIP LOCKED`, so any number of worker
//! processes can share one database.

pub mod recurring;
pub mod task;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::Result;
use crate::model::recurring::{
    Interval, NewRecurringTask, RecurringTaskDefinition, RecurringTaskId, RecurringTaskRun,
};
use crate::model::task::{NewTask, Task, TaskId, TaskRun};
use crate::store::{
    ClaimRequest, ClaimedTask, ExpandRequest, QueueCounts, TaskFilter, TaskStore, Transition,
};

/// Database handle. Owns the connection pool shared by all workers in the
/// process.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, 10).await
    }

    pub async fn connect_with(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool, for callers running their own queries next to
    /// the queue tables.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for Db {
    async fn enqueue(&self, new: NewTask, now: DateTime<Utc>) -> Result<TaskId> {
        self.insert_task(new, now).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.fetch_task(id).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.query_tasks(filter).await
    }

    async fn counts(&self) -> Result<QueueCounts> {
        self.count_by_state().await
    }

    async fn claim_batch(&self, req: &ClaimRequest) -> Result<Vec<ClaimedTask>> {
        self.claim_tasks(req).await
    }

    async fn resolve(&self, run: &TaskRun, transition: Transition) -> Result<Task> {
        self.resolve_task(run, transition).await
    }

    async fn task_runs(&self, id: TaskId) -> Result<Vec<TaskRun>> {
        self.fetch_task_runs(id).await
    }

    async fn purge_succeeded(&self, before: DateTime<Utc>) -> Result<u64> {
        self.delete_succeeded(before).await
    }

    async fn create_recurring(
        &self,
        new: NewRecurringTask,
        now: DateTime<Utc>,
    ) -> Result<RecurringTaskId> {
        self.insert_recurring(new, now).await
    }

    async fn get_recurring(&self, id: RecurringTaskId) -> Result<RecurringTaskDefinition> {
        self.fetch_recurring(id).await
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringTaskDefinition>> {
        self.query_recurring().await
    }

    async fn set_recurring_enabled(
        &self,
        id: RecurringTaskId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<RecurringTaskDefinition> {
        self.update_recurring_enabled(id, enabled, now).await
    }

    async fn set_recurring_interval(
        &self,
        id: RecurringTaskId,
        interval: Interval,
        now: DateTime<Utc>,
    ) -> Result<RecurringTaskDefinition> {
        self.update_recurring_interval(id, interval, now).await
    }

    async fn lock_due_recurring(&self, req: &ExpandRequest) -> Result<Vec<RecurringTaskDefinition>> {
        self.lock_due_definitions(req).await
    }

    async fn materialize_recurring(
        &self,
        id: RecurringTaskId,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskId>> {
        self.fire_recurring(id, holder, now).await
    }

    async fn release_recurring(&self, id: RecurringTaskId, holder: &str) -> Result<()> {
        self.unlock_recurring(id, holder).await
    }

    async fn recurring_runs(&self, id: RecurringTaskId) -> Result<Vec<RecurringTaskRun>> {
        self.fetch_recurring_runs(id).await
    }

    /// `SELECT 1`.
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
