//! Recurring definition operations: management, definition locks, and
//! materialization of due runs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::task::insert_task_on;
use crate::error::{Error, Result};
use crate::model::recurring::{
    Interval, NewRecurringTask, RecurringTaskDefinition, RecurringTaskId, RecurringTaskRun,
};
use crate::model::task::{NewTask, TaskId};
use crate::store::ExpandRequest;

const RECURRING_COLUMNS: &str = "id, action_name, args, interval_secs, cron_expression, enabled, \
     priority, max_attempts, is_locked, locked_by, locked_at, last_run, next_run_at, created_at, updated_at";

/// Take the definition-level lock on due definitions. Rows locked by a
/// concurrent expander's transaction are skipped; rows whose `is_locked` is
/// older than the lock timeout are taken over.
const LOCK_DUE: &str = "
    WITH due AS (
        SELECT id
        FROM recurring_task_definition
        WHERE enabled
          AND next_run_at <= $1
          AND (NOT is_locked OR locked_at IS NULL OR locked_at < $2)
        ORDER BY next_run_at ASC, id ASC
        LIMIT $3
        FOR UPDATE SKIP LOCKED
    )
    UPDATE recurring_task_definition d
    SET is_locked = TRUE, locked_by = $4, locked_at = $1
    FROM due
    WHERE d.id = due.id
    RETURNING d.id, d.action_name, d.args, d.interval_secs, d.cron_expression, d.enabled,
              d.priority, d.max_attempts, d.is_locked, d.locked_by, d.locked_at, d.last_run,
              d.next_run_at, d.created_at, d.updated_at";

fn interval_columns(interval: &Interval) -> (Option<i64>, Option<&str>) {
    match interval {
        Interval::Every { period } => (Some(period.as_secs() as i64), None),
        Interval::Cron { expression } => (None, Some(expression.as_str())),
    }
}

impl super::Db {
    pub(crate) async fn insert_recurring(
        &self,
        new: NewRecurringTask,
        now: DateTime<Utc>,
    ) -> Result<RecurringTaskId> {
        let definition = new.into_definition(now)?;
        let (interval_secs, cron_expression) = interval_columns(&definition.interval);

        sqlx::query(
            "INSERT INTO recurring_task_definition (id, action_name, args, interval_secs, cron_expression, enabled, priority, max_attempts, is_locked, next_run_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, $9, $10, $10)",
        )
        .bind(definition.id.0)
        .bind(&definition.action_name)
        .bind(&definition.args)
        .bind(interval_secs)
        .bind(cron_expression)
        .bind(definition.enabled)
        .bind(definition.priority)
        .bind(definition.max_attempts as i32)
        .bind(definition.next_run_at)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(definition.id)
    }

    pub(crate) async fn fetch_recurring(&self, id: RecurringTaskId) -> Result<RecurringTaskDefinition> {
        let sql = format!("SELECT {RECURRING_COLUMNS} FROM recurring_task_definition WHERE id = $1");
        let row: Option<RecurringRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;

        row.ok_or_else(|| Error::NotFound(format!("recurring task {id}")))?
            .try_into_definition()
    }

    pub(crate) async fn query_recurring(&self) -> Result<Vec<RecurringTaskDefinition>> {
        let sql = format!(
            "SELECT {RECURRING_COLUMNS} FROM recurring_task_definition ORDER BY created_at ASC, id ASC"
        );
        let rows: Vec<RecurringRow> = sqlx::query_as(&sql).fetch_all(self.pool()).await?;
        rows.into_iter().map(RecurringRow::try_into_definition).collect()
    }

    pub(crate) async fn update_recurring_enabled(
        &self,
        id: RecurringTaskId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<RecurringTaskDefinition> {
        let sql = format!(
            "UPDATE recurring_task_definition SET enabled = $1, updated_at = $2
             WHERE id = $3
             RETURNING {RECURRING_COLUMNS}"
        );
        let row: Option<RecurringRow> = sqlx::query_as(&sql)
            .bind(enabled)
            .bind(now)
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;

        row.ok_or_else(|| Error::NotFound(format!("recurring task {id}")))?
            .try_into_definition()
    }

    pub(crate) async fn update_recurring_interval(
        &self,
        id: RecurringTaskId,
        interval: Interval,
        now: DateTime<Utc>,
    ) -> Result<RecurringTaskDefinition> {
        interval.validate()?;
        let mut tx = self.pool().begin().await?;

        let last_run: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            "SELECT last_run FROM recurring_task_definition WHERE id = $1 FOR UPDATE",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let (last_run,) = last_run.ok_or_else(|| Error::NotFound(format!("recurring task {id}")))?;

        let next_run_at = interval.due_after(last_run, now)?;
        let (interval_secs, cron_expression) = interval_columns(&interval);

        let sql = format!(
            "UPDATE recurring_task_definition
             SET interval_secs = $1, cron_expression = $2, next_run_at = $3, updated_at = $4
             WHERE id = $5
             RETURNING {RECURRING_COLUMNS}"
        );
        let row: RecurringRow = sqlx::query_as(&sql)
            .bind(interval_secs)
            .bind(cron_expression)
            .bind(next_run_at)
            .bind(now)
            .bind(id.0)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        row.try_into_definition()
    }

    pub(crate) async fn lock_due_definitions(
        &self,
        req: &ExpandRequest,
    ) -> Result<Vec<RecurringTaskDefinition>> {
        if req.limit == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<RecurringRow> = sqlx::query_as(LOCK_DUE)
            .bind(req.now)
            .bind(req.stale_before())
            .bind(req.limit as i64)
            .bind(&req.holder)
            .fetch_all(self.pool())
            .await?;

        let mut locked = rows
            .into_iter()
            .map(RecurringRow::try_into_definition)
            .collect::<Result<Vec<_>>>()?;
        locked.sort_by_key(|d| (d.next_run_at, d.id));
        Ok(locked)
    }

    pub(crate) async fn fire_recurring(
        &self,
        id: RecurringTaskId,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskId>> {
        let mut tx = self.pool().begin().await?;

        let sql = format!(
            "SELECT {RECURRING_COLUMNS} FROM recurring_task_definition WHERE id = $1 FOR UPDATE"
        );
        let row: Option<RecurringRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let definition = row
            .ok_or_else(|| Error::NotFound(format!("recurring task {id}")))?
            .try_into_definition()?;

        if !definition.is_locked || definition.locked_by.as_deref() != Some(holder) {
            return Err(Error::RecurringLockLost {
                id,
                holder: holder.to_string(),
            });
        }

        if !definition.enabled {
            sqlx::query(
                "UPDATE recurring_task_definition SET is_locked = FALSE, locked_by = NULL, locked_at = NULL
                 WHERE id = $1",
            )
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(None);
        }

        let next_run_at = definition.interval.next_after(now)?;
        let task = NewTask::new(definition.action_name)
            .args(definition.args)
            .priority(definition.priority)
            .max_attempts(definition.max_attempts)
            .scheduled_for(now)
            .into_task(now)?;

        insert_task_on(&mut *tx, &task).await?;

        sqlx::query(
            "INSERT INTO recurring_task_run (definition_id, task_id, fired_at) VALUES ($1, $2, $3)",
        )
        .bind(id.0)
        .bind(task.id.0)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE recurring_task_definition
             SET last_run = $1, next_run_at = $2, is_locked = FALSE, locked_by = NULL, locked_at = NULL, updated_at = $1
             WHERE id = $3",
        )
        .bind(now)
        .bind(next_run_at)
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(task.id))
    }

    pub(crate) async fn unlock_recurring(&self, id: RecurringTaskId, holder: &str) -> Result<()> {
        sqlx::query(
            "UPDATE recurring_task_definition SET is_locked = FALSE, locked_by = NULL, locked_at = NULL
             WHERE id = $1 AND is_locked AND locked_by = $2",
        )
        .bind(id.0)
        .bind(holder)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub(crate) async fn fetch_recurring_runs(
        &self,
        id: RecurringTaskId,
    ) -> Result<Vec<RecurringTaskRun>> {
        self.fetch_recurring(id).await?;

        let rows: Vec<(Uuid, Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT definition_id, task_id, fired_at FROM recurring_task_run
             WHERE definition_id = $1 ORDER BY id ASC",
        )
        .bind(id.0)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(definition_id, task_id, fired_at)| RecurringTaskRun {
                definition_id: RecurringTaskId(definition_id),
                task_id: TaskId(task_id),
                fired_at,
            })
            .collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RecurringRow {
    id: Uuid,
    action_name: String,
    args: serde_json::Value,
    interval_secs: Option<i64>,
    cron_expression: Option<String>,
    enabled: bool,
    priority: i32,
    max_attempts: i32,
    is_locked: bool,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    next_run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RecurringRow {
    fn try_into_definition(self) -> Result<RecurringTaskDefinition> {
        let interval = match (self.interval_secs, self.cron_expression) {
            (Some(secs), _) => Interval::Every {
                period: Duration::from_secs(secs.max(0) as u64),
            },
            (None, Some(expression)) => Interval::Cron { expression },
            (None, None) => {
                return Err(Error::Other(format!(
                    "recurring task {} has no interval",
                    self.id
                )));
            }
        };

        Ok(RecurringTaskDefinition {
            id: RecurringTaskId(self.id),
            action_name: self.action_name,
            args: self.args,
            interval,
            enabled: self.enabled,
            priority: self.priority,
            max_attempts: self.max_attempts as u32,
            is_locked: self.is_locked,
            locked_by: self.locked_by,
            locked_at: self.locked_at,
            last_run: self.last_run,
            next_run_at: self.next_run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
