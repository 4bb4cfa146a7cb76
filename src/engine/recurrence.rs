//! Recurrence expander: turns due recurring definitions into tasks.
//!
//! Any number of expanders may run against one store. A definition is only
//! expanded by the holder of its `is_locked` flag, and the spawned task,
//! the new `last_run` and the released lock are written in one atomic
//! store operation, so a due interval fires exactly once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::error_backoff;
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::model::task::TaskId;
use crate::store::{ExpandRequest, TaskStore};
use crate::telemetry::metrics;

/// Most definitions locked in one tick.
const EXPAND_LIMIT: usize = 100;

#[derive(Clone)]
pub struct RecurrenceExpander {
    store: Arc<dyn TaskStore>,
    config: Arc<WorkerConfig>,
}

impl RecurrenceExpander {
    pub fn new(store: Arc<dyn TaskStore>, config: WorkerConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    /// Expand every definition due at `now`. Returns the spawned task ids.
    ///
    /// A definition that fails to materialize is released and left for the
    /// next tick; the others still fire.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let req = ExpandRequest {
            holder: self.config.worker_id.clone(),
            now,
            lock_timeout: self.config.lock_timeout_chrono(),
            limit: EXPAND_LIMIT,
        };

        let due = self.store.lock_due_recurring(&req).await?;
        let mut fired = Vec::with_capacity(due.len());

        for definition in due {
            match self
                .store
                .materialize_recurring(definition.id, &req.holder, now)
                .await
            {
                Ok(Some(task_id)) => {
                    info!(
                        recurring_id = %definition.id,
                        task_id = %task_id,
                        action = %definition.action_name,
                        interval = %definition.interval,
                        "recurring task fired"
                    );
                    metrics::recurring_fired()
                        .add(1, &[KeyValue::new("action", definition.action_name.clone())]);
                    fired.push(task_id);
                }
                Ok(None) => {
                    debug!(recurring_id = %definition.id, "definition disabled before firing");
                }
                Err(e) => {
                    warn!(recurring_id = %definition.id, error = %e, "recurring expansion failed");
                    if let Err(e) = self.store.release_recurring(definition.id, &req.holder).await
                    {
                        // The lock expires after lock_timeout.
                        warn!(recurring_id = %definition.id, error = %e, "failed to release definition lock");
                    }
                }
            }
        }

        Ok(fired)
    }

    /// Tick every `recurrence_tick` until `shutdown` becomes true or its
    /// sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            holder = %self.config.worker_id,
            tick = ?self.config.recurrence_tick,
            "recurrence expander started"
        );

        let mut consecutive_errors = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.tick(Utc::now()).await {
                Ok(_) => {
                    consecutive_errors = 0;
                    self.config.recurrence_tick
                }
                Err(e) => {
                    consecutive_errors += 1;
                    metrics::poll_errors().add(1, &[KeyValue::new("loop", "recurrence")]);
                    let wait = error_backoff(
                        self.config.recurrence_tick,
                        consecutive_errors,
                        self.config.error_backoff_max,
                    );
                    error!(error = %e, retry_in = ?wait, "recurrence tick failed");
                    wait
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(holder = %self.config.worker_id, "recurrence expander stopped");
    }
}
