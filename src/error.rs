//! Error types for taskproc.
//!
//! Store and configuration failures live here. Failures raised by task
//! actions are not crate errors; the dispatcher classifies those into
//! [`crate::engine::Failure`].

use thiserror::Error;

use crate::model::recurring::RecurringTaskId;
use crate::model::task::TaskId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The row is no longer locked by this worker. Its lock expired and was
    /// reclaimed, or it was resolved by someone else.
    #[error("task {task_id} is no longer locked by {worker_id}")]
    LockLost { task_id: TaskId, worker_id: String },

    #[error("recurring task {id} is not locked by {holder}")]
    RecurringLockLost { id: RecurringTaskId, holder: String },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the same call later may succeed.
    ///
    /// Worker loops back off and retry the whole cycle on any error; this is
    /// used to pick the log level.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Store(e) => !matches!(
                e,
                sqlx::Error::RowNotFound | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
