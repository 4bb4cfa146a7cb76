//! Task operations: enqueue, atomic claim, outcome write-back, history.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::task::{NewTask, RunResult, Task, TaskId, TaskRun, TaskState};
use crate::store::{ClaimRequest, ClaimedTask, QueueCounts, TaskFilter, Transition};

const TASK_COLUMNS: &str = "id, action_name, args, state, priority, scheduled_for, attempts, \
     max_attempts, locked_by, locked_at, last_error, created_at, updated_at";

/// A stale lock on a task with no attempts left ends the task. Rows another
/// claim is already touching are skipped; that claim abandons them instead.
const ABANDON_STALE_EXHAUSTED: &str = "
    WITH exhausted AS (
        SELECT id
        FROM task
        WHERE state = 'locked' AND locked_at < $2 AND attempts >= max_attempts
        ORDER BY id
        FOR UPDATE SKIP LOCKED
    )
    UPDATE task t
    SET state = 'abandoned',
        last_error = 'lock held by ' || t.locked_by || ' expired after ' || t.attempts::text || ' attempts',
        locked_by = NULL,
        locked_at = NULL,
        updated_at = $1
    FROM exhausted e
    WHERE t.id = e.id";

/// Select-and-lock in one statement. `FOR UPDATE SKIP LOCKED` makes rows
/// selected by a concurrent claim invisible to this one, and the UPDATE runs
/// on exactly the rows the CTE locked.
const CLAIM: &str = "
    WITH claimable AS (
        SELECT id, locked_by AS previous_holder
        FROM task
        WHERE (state = 'pending' AND scheduled_for <= $1)
           OR (state = 'locked' AND locked_at < $2 AND attempts < max_attempts)
        ORDER BY priority DESC, scheduled_for ASC, created_at ASC, id ASC
        LIMIT $3
        FOR UPDATE SKIP LOCKED
    )
    UPDATE task t
    SET state = 'locked',
        locked_by = $4,
        locked_at = $1,
        attempts = t.attempts + 1,
        updated_at = $1
    FROM claimable c
    WHERE t.id = c.id
    RETURNING t.id, t.action_name, t.args, t.state, t.priority, t.scheduled_for, t.attempts,
              t.max_attempts, t.locked_by, t.locked_at, t.last_error, t.created_at, t.updated_at,
              c.previous_holder";

impl super::Db {
    pub(crate) async fn insert_task(&self, new: NewTask, now: DateTime<Utc>) -> Result<TaskId> {
        let task = new.into_task(now)?;
        let mut conn = self.pool().acquire().await?;
        insert_task_on(&mut *conn, &task).await?;
        Ok(task.id)
    }

    pub(crate) async fn fetch_task(&self, id: TaskId) -> Result<Task> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM task WHERE id = $1");
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;

        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    pub(crate) async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task
             WHERE ($1::text IS NULL OR state = $1)
               AND ($2::text IS NULL OR action_name = $2)
             ORDER BY created_at DESC, id DESC
             LIMIT $3"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(filter.state.map(|s| s.as_str()))
            .bind(filter.action_name.as_deref())
            .bind(filter.limit.map(|n| n as i64))
            .fetch_all(self.pool())
            .await?;

        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    pub(crate) async fn count_by_state(&self) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM task GROUP BY state")
                .fetch_all(self.pool())
                .await?;

        let mut counts = QueueCounts::default();
        for (state, n) in rows {
            counts.add(state.parse()?, n as u64);
        }
        Ok(counts)
    }

    pub(crate) async fn claim_tasks(&self, req: &ClaimRequest) -> Result<Vec<ClaimedTask>> {
        if req.batch_size == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool().begin().await?;

        let abandoned = sqlx::query(ABANDON_STALE_EXHAUSTED)
            .bind(req.now)
            .bind(req.stale_before())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if abandoned > 0 {
            warn!(abandoned, "stale locks on exhausted tasks abandoned");
        }

        let rows: Vec<ClaimRow> = sqlx::query_as(CLAIM)
            .bind(req.now)
            .bind(req.stale_before())
            .bind(req.batch_size as i64)
            .bind(&req.worker_id)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        // UPDATE ... RETURNING does not preserve the CTE's order.
        let mut claimed = rows
            .into_iter()
            .map(|row| {
                Ok(ClaimedTask {
                    reclaimed_from: row.previous_holder,
                    task: row.task.try_into_task()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        claimed.sort_by_key(|c| c.task.claim_order());
        Ok(claimed)
    }

    pub(crate) async fn resolve_task(&self, run: &TaskRun, transition: Transition) -> Result<Task> {
        let to = transition.target_state();
        let scheduled_for = match transition {
            Transition::Retry { scheduled_for } => Some(scheduled_for),
            _ => None,
        };

        let mut tx = self.pool().begin().await?;

        let sql = format!(
            "UPDATE task
             SET state = $1,
                 scheduled_for = COALESCE($2, scheduled_for),
                 last_error = COALESCE($3, last_error),
                 locked_by = NULL,
                 locked_at = NULL,
                 updated_at = $4
             WHERE id = $5 AND state = 'locked' AND locked_by = $6 AND attempts = $7
               AND ($1 <> 'pending' OR attempts < max_attempts)
             RETURNING {TASK_COLUMNS}"
        );
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(to.as_str())
            .bind(scheduled_for)
            .bind(run.error.as_deref())
            .bind(run.finished_at)
            .bind(run.task_id.0)
            .bind(&run.worker_id)
            .bind(run.attempt as i32)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(self.explain_unresolved(run, to).await);
        };

        sqlx::query(
            "INSERT INTO task_run (task_id, worker_id, attempt, started_at, finished_at, result, error)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(run.task_id.0)
        .bind(&run.worker_id)
        .bind(run.attempt as i32)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.result.as_str())
        .bind(run.error.as_deref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into_task()
    }

    /// Why a guarded outcome update touched no row.
    async fn explain_unresolved(&self, run: &TaskRun, to: TaskState) -> Error {
        match self.fetch_task(run.task_id).await {
            Ok(task)
                if task.state == TaskState::Locked
                    && task.locked_by.as_deref() == Some(run.worker_id.as_str())
                    && task.attempts == run.attempt =>
            {
                Error::InvalidTransition {
                    from: format!("locked ({}/{} attempts)", task.attempts, task.max_attempts),
                    to: to.to_string(),
                }
            }
            Ok(_) => Error::LockLost {
                task_id: run.task_id,
                worker_id: run.worker_id.clone(),
            },
            Err(e) => e,
        }
    }

    pub(crate) async fn fetch_task_runs(&self, id: TaskId) -> Result<Vec<TaskRun>> {
        // Distinguish "no runs yet" from "no such task".
        self.fetch_task(id).await?;

        let rows: Vec<TaskRunRow> = sqlx::query_as(
            "SELECT task_id, worker_id, attempt, started_at, finished_at, result, error
             FROM task_run WHERE task_id = $1 ORDER BY id ASC",
        )
        .bind(id.0)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TaskRunRow::try_into_run).collect()
    }

    pub(crate) async fn delete_succeeded(&self, before: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM task WHERE state = 'success' AND created_at < $1")
            .bind(before)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

/// Insert a pending task. Takes a connection so it runs inside the caller's
/// transaction when there is one.
pub(crate) async fn insert_task_on(conn: &mut PgConnection, task: &Task) -> Result<()> {
    sqlx::query(
        "INSERT INTO task (id, action_name, args, state, priority, scheduled_for, attempts, max_attempts, created_at, updated_at)
         VALUES ($1, $2, $3, 'pending', $4, $5, 0, $6, $7, $7)",
    )
    .bind(task.id.0)
    .bind(&task.action_name)
    .bind(&task.args)
    .bind(task.priority)
    .bind(task.scheduled_for)
    .bind(task.max_attempts as i32)
    .bind(task.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    action_name: String,
    args: serde_json::Value,
    state: String,
    priority: i32,
    scheduled_for: DateTime<Utc>,
    attempts: i32,
    max_attempts: i32,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            action_name: self.action_name,
            args: self.args,
            state: self.state.parse()?,
            priority: self.priority,
            scheduled_for: self.scheduled_for,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            locked_by: self.locked_by,
            locked_at: self.locked_at,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    #[sqlx(flatten)]
    task: TaskRow,
    previous_holder: Option<String>,
}

#[derive(sqlx::FromRow)]
struct TaskRunRow {
    task_id: Uuid,
    worker_id: String,
    attempt: i32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    result: String,
    error: Option<String>,
}

impl TaskRunRow {
    fn try_into_run(self) -> Result<TaskRun> {
        Ok(TaskRun {
            task_id: TaskId(self.task_id),
            worker_id: self.worker_id,
            attempt: self.attempt as u32,
            started_at: self.started_at,
            finished_at: self.finished_at,
            result: self.result.parse::<RunResult>()?,
            error: self.error,
        })
    }
}
