//! Worker: one dispatcher and one recurrence expander sharing a shutdown
//! signal.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::dispatcher::Dispatcher;
use super::recurrence::RecurrenceExpander;
use crate::config::WorkerConfig;
use crate::registry::ActionRegistry;
use crate::store::TaskStore;

/// Handle to the loops of one worker process.
///
/// Dropping the handle drops the shutdown sender, which also stops the
/// loops, but without waiting for in-flight tasks.
pub struct Worker {
    worker_id: String,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<(&'static str, JoinHandle<()>)>,
}

impl Worker {
    /// Spawn the dispatcher and the recurrence expander.
    pub fn spawn(
        store: Arc<dyn TaskStore>,
        registry: Arc<ActionRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self::spawn_with(store, registry, config, true)
    }

    /// Spawn the dispatcher, and the expander only if `expand_recurring`.
    pub fn spawn_with(
        store: Arc<dyn TaskStore>,
        registry: Arc<ActionRegistry>,
        config: WorkerConfig,
        expand_recurring: bool,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_id = config.worker_id.clone();
        let mut joins = Vec::with_capacity(2);

        let dispatcher = Dispatcher::new(Arc::clone(&store), registry, config.clone());
        let rx = shutdown_rx.clone();
        joins.push((
            "dispatcher",
            tokio::spawn(async move { dispatcher.run(rx).await }),
        ));

        if expand_recurring {
            let expander = RecurrenceExpander::new(store, config);
            let rx = shutdown_rx;
            joins.push((
                "recurrence",
                tokio::spawn(async move { expander.run(rx).await }),
            ));
        }

        info!(worker_id = %worker_id, expand_recurring, "worker started");
        Self {
            worker_id,
            shutdown_tx,
            joins,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Stop claiming and expanding. Attempts already running still finish.
    pub fn request_shutdown(&self) {
        // Receivers may already be gone.
        let _ = self.shutdown_tx.send(true);
    }

    /// Request shutdown and wait for in-flight attempts to be recorded.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for (name, join) in self.joins {
            if let Err(e) = join.await {
                warn!(loop_name = name, error = %e, "worker loop ended abnormally");
            }
        }
        info!(worker_id = %self.worker_id, "worker stopped");
    }
}
