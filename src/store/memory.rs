//! In-memory store.
//!
//! One `tokio::sync::Mutex` guards every table, so each trait method runs as
//! a single critical section: selection and locking in `claim_batch` can
//! never interleave with another caller. This is the in-process counterpart
//! of the Postgres transaction in [`crate::db`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{ClaimRequest, ClaimedTask, ExpandRequest, QueueCounts, TaskFilter, TaskStore, Transition};
use crate::error::{Error, Result};
use crate::model::recurring::{
    Interval, NewRecurringTask, RecurringTaskDefinition, RecurringTaskId, RecurringTaskRun,
};
use crate::model::task::{NewTask, Task, TaskId, TaskRun, TaskState};

#[derive(Default)]
struct Tables {
    tasks: HashMap<TaskId, Task>,
    runs: Vec<TaskRun>,
    recurring: HashMap<RecurringTaskId, RecurringTaskDefinition>,
    recurring_runs: Vec<RecurringTaskRun>,
}

impl Tables {
    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    fn recurring_mut(&mut self, id: RecurringTaskId) -> Result<&mut RecurringTaskDefinition> {
        self.recurring
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("recurring task {id}")))
    }
}

/// In-memory [`TaskStore`]. Cheap to clone; clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn release_lock(task: &mut Task) {
    task.locked_by = None;
    task.locked_at = None;
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn enqueue(&self, new: NewTask, now: DateTime<Utc>) -> Result<TaskId> {
        let task = new.into_task(now)?;
        let id = task.id;
        self.tables.lock().await.tasks.insert(id, task);
        Ok(id)
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        let tables = self.tables.lock().await;
        tables
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let tables = self.tables.lock().await;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| filter.state.is_none_or(|s| t.state == s))
            .filter(|t| {
                filter
                    .action_name
                    .as_deref()
                    .is_none_or(|a| t.action_name == a)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let tables = self.tables.lock().await;
        let mut counts = QueueCounts::default();
        for task in tables.tasks.values() {
            counts.add(task.state, 1);
        }
        Ok(counts)
    }

    async fn claim_batch(&self, req: &ClaimRequest) -> Result<Vec<ClaimedTask>> {
        let mut tables = self.tables.lock().await;

        // Stale locks with no attempts left are abandoned, not reclaimed.
        for task in tables.tasks.values_mut() {
            if task.has_stale_lock(req.now, req.lock_timeout) && task.attempts >= task.max_attempts
            {
                task.state = TaskState::Abandoned;
                task.last_error = Some(format!(
                    "lock held by {} expired after {} attempts",
                    task.locked_by.as_deref().unwrap_or("unknown"),
                    task.attempts
                ));
                task.updated_at = req.now;
                release_lock(task);
            }
        }

        let mut eligible: Vec<&Task> = tables
            .tasks
            .values()
            .filter(|t| t.is_claimable(req.now, req.lock_timeout))
            .collect();
        eligible.sort_by_key(|t| t.claim_order());
        let selected: Vec<TaskId> = eligible.iter().take(req.batch_size).map(|t| t.id).collect();

        let mut claimed = Vec::with_capacity(selected.len());
        for id in selected {
            let task = tables.task_mut(id)?;
            let reclaimed_from = if task.state == TaskState::Locked {
                task.locked_by.take()
            } else {
                None
            };
            task.state = TaskState::Locked;
            task.locked_by = Some(req.worker_id.clone());
            task.locked_at = Some(req.now);
            task.attempts += 1;
            task.updated_at = req.now;
            claimed.push(ClaimedTask {
                task: task.clone(),
                reclaimed_from,
            });
        }
        Ok(claimed)
    }

    async fn resolve(&self, run: &TaskRun, transition: Transition) -> Result<Task> {
        let mut tables = self.tables.lock().await;
        let task = tables.task_mut(run.task_id)?;

        let holds_lock = task.state == TaskState::Locked
            && task.locked_by.as_deref() == Some(run.worker_id.as_str())
            && task.attempts == run.attempt;
        if !holds_lock {
            return Err(Error::LockLost {
                task_id: run.task_id,
                worker_id: run.worker_id.clone(),
            });
        }

        let to = transition.target_state();
        if matches!(transition, Transition::Retry { .. }) && task.attempts >= task.max_attempts {
            return Err(Error::InvalidTransition {
                from: format!("locked ({}/{} attempts)", task.attempts, task.max_attempts),
                to: to.to_string(),
            });
        }

        task.state = to;
        if let Transition::Retry { scheduled_for } = transition {
            task.scheduled_for = scheduled_for;
        }
        if run.error.is_some() {
            task.last_error = run.error.clone();
        }
        task.updated_at = run.finished_at;
        release_lock(task);

        let task = task.clone();
        tables.runs.push(run.clone());
        Ok(task)
    }

    async fn task_runs(&self, id: TaskId) -> Result<Vec<TaskRun>> {
        let tables = self.tables.lock().await;
        if !tables.tasks.contains_key(&id) {
            return Err(Error::NotFound(format!("task {id}")));
        }
        Ok(tables.runs.iter().filter(|r| r.task_id == id).cloned().collect())
    }

    async fn purge_succeeded(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let doomed: Vec<TaskId> = tables
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Success && t.created_at < before)
            .map(|t| t.id)
            .collect();
        for id in &doomed {
            tables.tasks.remove(id);
        }
        tables.runs.retain(|r| !doomed.contains(&r.task_id));
        Ok(doomed.len() as u64)
    }

    async fn create_recurring(
        &self,
        new: NewRecurringTask,
        now: DateTime<Utc>,
    ) -> Result<RecurringTaskId> {
        let definition = new.into_definition(now)?;
        let id = definition.id;
        self.tables.lock().await.recurring.insert(id, definition);
        Ok(id)
    }

    async fn get_recurring(&self, id: RecurringTaskId) -> Result<RecurringTaskDefinition> {
        let tables = self.tables.lock().await;
        tables
            .recurring
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("recurring task {id}")))
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringTaskDefinition>> {
        let tables = self.tables.lock().await;
        let mut definitions: Vec<_> = tables.recurring.values().cloned().collect();
        definitions.sort_by_key(|d| (d.created_at, d.id));
        Ok(definitions)
    }

    async fn set_recurring_enabled(
        &self,
        id: RecurringTaskId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<RecurringTaskDefinition> {
        let mut tables = self.tables.lock().await;
        let definition = tables.recurring_mut(id)?;
        definition.enabled = enabled;
        definition.updated_at = now;
        Ok(definition.clone())
    }

    async fn set_recurring_interval(
        &self,
        id: RecurringTaskId,
        interval: Interval,
        now: DateTime<Utc>,
    ) -> Result<RecurringTaskDefinition> {
        interval.validate()?;
        let mut tables = self.tables.lock().await;
        let definition = tables.recurring_mut(id)?;
        definition.next_run_at = interval.due_after(definition.last_run, now)?;
        definition.interval = interval;
        definition.updated_at = now;
        Ok(definition.clone())
    }

    async fn lock_due_recurring(&self, req: &ExpandRequest) -> Result<Vec<RecurringTaskDefinition>> {
        let mut tables = self.tables.lock().await;

        let mut due: Vec<&RecurringTaskDefinition> = tables
            .recurring
            .values()
            .filter(|d| d.is_expandable(req.now, req.lock_timeout))
            .collect();
        due.sort_by_key(|d| (d.next_run_at, d.id));
        let selected: Vec<RecurringTaskId> = due.iter().take(req.limit).map(|d| d.id).collect();

        let mut locked = Vec::with_capacity(selected.len());
        for id in selected {
            let definition = tables.recurring_mut(id)?;
            definition.is_locked = true;
            definition.locked_by = Some(req.holder.clone());
            definition.locked_at = Some(req.now);
            locked.push(definition.clone());
        }
        Ok(locked)
    }

    async fn materialize_recurring(
        &self,
        id: RecurringTaskId,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskId>> {
        let mut tables = self.tables.lock().await;
        let definition = tables.recurring_mut(id)?;

        if !definition.is_locked || definition.locked_by.as_deref() != Some(holder) {
            return Err(Error::RecurringLockLost {
                id,
                holder: holder.to_string(),
            });
        }

        if !definition.enabled {
            definition.is_locked = false;
            definition.locked_by = None;
            definition.locked_at = None;
            return Ok(None);
        }

        let next_run_at = definition.interval.next_after(now)?;
        let task = NewTask::new(definition.action_name.clone())
            .args(definition.args.clone())
            .priority(definition.priority)
            .max_attempts(definition.max_attempts)
            .scheduled_for(now)
            .into_task(now)?;
        let task_id = task.id;

        definition.last_run = Some(now);
        definition.next_run_at = next_run_at;
        definition.is_locked = false;
        definition.locked_by = None;
        definition.locked_at = None;
        definition.updated_at = now;

        tables.tasks.insert(task_id, task);
        tables.recurring_runs.push(RecurringTaskRun {
            definition_id: id,
            task_id,
            fired_at: now,
        });
        Ok(Some(task_id))
    }

    async fn release_recurring(&self, id: RecurringTaskId, holder: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let definition = tables.recurring_mut(id)?;
        if definition.is_locked && definition.locked_by.as_deref() == Some(holder) {
            definition.is_locked = false;
            definition.locked_by = None;
            definition.locked_at = None;
        }
        Ok(())
    }

    async fn recurring_runs(&self, id: RecurringTaskId) -> Result<Vec<RecurringTaskRun>> {
        let tables = self.tables.lock().await;
        if !tables.recurring.contains_key(&id) {
            return Err(Error::NotFound(format!("recurring task {id}")));
        }
        Ok(tables
            .recurring_runs
            .iter()
            .filter(|r| r.definition_id == id)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
