//! Dispatcher: claims batches, runs actions, writes back outcomes.
//!
//! One dispatcher runs per worker process. Each cycle claims up to
//! `batch_size` tasks through the store's atomic claim, executes them on a
//! pool bounded by `max_concurrent`, and resolves every attempt before the
//! next claim. Shutdown stops claiming; attempts already running finish and
//! are recorded.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use super::retry::RetryPolicy;
use super::{Failure, error_backoff};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::model::task::{RunResult, Task, TaskRun};
use crate::registry::{ActionRegistry, PermanentFailure};
use crate::store::{ClaimRequest, ClaimedTask, TaskStore, Transition};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    registry: Arc<ActionRegistry>,
    config: Arc<WorkerConfig>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<ActionRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            store,
            registry,
            config: Arc::new(config),
            retry,
            permits,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the claim loop until `shutdown` becomes true or its sender is
    /// dropped.
    ///
    /// Store errors never end the loop: they are logged and the next cycle
    /// waits with a growing backoff.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            "dispatcher started"
        );

        let mut consecutive_errors = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.run_once().await {
                // A full batch suggests more work is waiting.
                Ok(claimed) if claimed >= self.config.batch_size => {
                    consecutive_errors = 0;
                    continue;
                }
                Ok(_) => {
                    consecutive_errors = 0;
                    self.config.poll_interval
                }
                Err(e) => {
                    consecutive_errors += 1;
                    metrics::poll_errors().add(1, &[KeyValue::new("loop", "dispatcher")]);
                    let wait = error_backoff(
                        self.config.poll_interval,
                        consecutive_errors,
                        self.config.error_backoff_max,
                    );
                    if e.is_transient() {
                        warn!(error = %e, retry_in = ?wait, "claim cycle failed");
                    } else {
                        error!(error = %e, retry_in = ?wait, "claim cycle failed");
                    }
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

        info!(worker_id = %self.config.worker_id, "dispatcher stopped");
    }

    /// One claim cycle: claim a batch, execute it, record every outcome.
    /// Returns the number of tasks claimed.
    pub async fn run_once(&self) -> Result<usize> {
        let req = ClaimRequest {
            worker_id: self.config.worker_id.clone(),
            batch_size: self.config.batch_size,
            now: Utc::now(),
            lock_timeout: self.config.lock_timeout_chrono(),
        };
        let batch = self.store.claim_batch(&req).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let claimed = batch.len();
        debug!(claimed, worker_id = %req.worker_id, "claimed batch");
        metrics::task_claimed().add(claimed as u64, &[]);

        let mut running = JoinSet::new();
        for task in batch {
            let this = self.clone();
            running.spawn(async move { this.process(task).await });
        }
        while let Some(joined) = running.join_next().await {
            // `process` never panics on action failure; a join error here is
            // a bug in the bookkeeping itself.
            if let Err(e) = joined {
                error!(error = %e, "task bookkeeping aborted");
            }
        }

        Ok(claimed)
    }

    async fn process(&self, claimed: ClaimedTask) {
        let ClaimedTask {
            task,
            reclaimed_from,
        } = claimed;
        let span = start_task_span(&task.action_name, &task.id, task.attempts);

        async {
            match reclaimed_from {
                Some(previous) => {
                    warn!(
                        task_id = %task.id,
                        previous_holder = %previous,
                        attempt = task.attempts,
                        "reclaimed stale lock"
                    );
                    metrics::task_stale_reclaimed().add(1, &[]);
                    record_state_transition(&span, "locked", "locked");
                }
                None => record_state_transition(&span, "pending", "locked"),
            }

            let Ok(_permit) = self.permits.acquire().await else {
                // Semaphore closed: leave the lock to expire.
                return;
            };

            let started_at = Utc::now();
            let clock = Instant::now();
            let outcome = self.execute(&task).await;
            let finished_at = Utc::now();

            metrics::task_duration_ms().record(
                clock.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("action", task.action_name.clone())],
            );

            self.report(&task, started_at, finished_at, outcome, &span)
                .await;
        }
        .instrument(span.clone())
        .await
    }

    /// Run the task's action under the per-task timeout. The action runs on
    /// its own tokio task so a panic is contained and classified.
    async fn execute(&self, task: &Task) -> std::result::Result<(), Failure> {
        let Some(action) = self.registry.get(&task.action_name) else {
            return Err(Failure::UnknownAction(task.action_name.clone()));
        };

        let args = task.args.clone();
        let mut handle =
            tokio::spawn(async move { action.run(&args).await }.in_current_span());

        match tokio::time::timeout(self.config.task_timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) if PermanentFailure::is_permanent(&e) => {
                Err(Failure::Permanent(format!("{e:#}")))
            }
            Ok(Ok(Err(e))) => Err(Failure::Action(format!("{e:#}"))),
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(Failure::Panicked(panic_message(join_err.into_panic())))
            }
            Ok(Err(join_err)) => Err(Failure::Action(join_err.to_string())),
            Err(_elapsed) => {
                handle.abort();
                Err(Failure::TimedOut(self.config.task_timeout))
            }
        }
    }

    async fn report(
        &self,
        task: &Task,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: std::result::Result<(), Failure>,
        span: &tracing::Span,
    ) {
        let (transition, result, error) = match &outcome {
            Ok(()) => (Transition::Succeed, RunResult::Success, None),
            Err(failure) => (
                self.retry.decide(task, failure, finished_at),
                RunResult::Failure,
                Some(failure.to_string()),
            ),
        };

        let run = TaskRun {
            task_id: task.id,
            worker_id: self.config.worker_id.clone(),
            attempt: task.attempts,
            started_at,
            finished_at,
            result,
            error,
        };

        match self.store.resolve(&run, transition).await {
            Ok(updated) => {
                record_state_transition(span, "locked", updated.state.as_str());
                let label = match transition {
                    Transition::Succeed => "success",
                    Transition::Retry { .. } => "retry",
                    Transition::Abandon => "abandoned",
                };
                metrics::task_outcomes().add(
                    1,
                    &[
                        KeyValue::new("action", task.action_name.clone()),
                        KeyValue::new("outcome", label),
                    ],
                );
                log_outcome(&updated, transition, &outcome, run.duration_ms());
            }
            Err(Error::LockLost { .. }) => {
                warn!(
                    task_id = %task.id,
                    attempt = task.attempts,
                    "lock lost before the outcome was recorded; result discarded"
                );
            }
            Err(e) => {
                error!(
                    task_id = %task.id,
                    error = %e,
                    "failed to record outcome; the lock will expire"
                );
            }
        }
    }
}

fn log_outcome(
    task: &Task,
    transition: Transition,
    outcome: &std::result::Result<(), Failure>,
    duration_ms: u64,
) {
    let failure = outcome.as_ref().err();
    let error = failure.map(ToString::to_string).unwrap_or_default();
    match transition {
        Transition::Succeed => {
            info!(task_id = %task.id, attempt = task.attempts, duration_ms, "task succeeded");
        }
        Transition::Retry { scheduled_for } => {
            warn!(
                task_id = %task.id,
                attempt = task.attempts,
                max_attempts = task.max_attempts,
                error = %error,
                retry_at = %scheduled_for,
                "task failed, retry scheduled"
            );
        }
        Transition::Abandon => {
            error!(
                task_id = %task.id,
                attempt = task.attempts,
                max_attempts = task.max_attempts,
                kind = failure.map_or("none", Failure::kind),
                error = %error,
                "task abandoned"
            );
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
