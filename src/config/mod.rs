//! Typed configuration.
//!
//! [`Config`] holds process-level settings from the environment and fails
//! fast if required vars are missing. Sensitive values are wrapped in
//! secrecy::SecretString to prevent log leaks.
//!
//! [`WorkerConfig`] holds queue policy. Every value has a default and can be
//! overridden from `TASKPROC_*` environment variables or a TOML file.

pub mod secrets;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::task::DEFAULT_MAX_ATTEMPTS;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Backoff applied when a failed task is rescheduled.
///
/// The delay before retry `n` (1-based count of attempts made) is
/// `base_delay * multiplier^(n-1)`, capped at `max_delay`, then spread by
/// up to `jitter` of itself in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
            jitter: 0.1,
        }
    }
}

/// Longest lock a worker may hold before others treat it as stale.
pub const MAX_LOCK_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Queue policy for one worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Identity written to `locked_by`. Must be unique per live process.
    pub worker_id: String,
    /// Most tasks claimed per poll.
    pub batch_size: usize,
    /// Sleep between polls when the last claim was not full.
    pub poll_interval: Duration,
    /// Locks older than this are stale and may be reclaimed.
    pub lock_timeout: Duration,
    /// Per-attempt execution limit enforced by the dispatcher.
    pub task_timeout: Duration,
    /// Tasks executing at once in this process.
    pub max_concurrent: usize,
    /// Period of the recurrence expander.
    pub recurrence_tick: Duration,
    /// `max_attempts` for tasks enqueued without one.
    pub default_max_attempts: u32,
    /// Cap on the backoff after consecutive store errors.
    pub error_backoff_max: Duration,
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(300),
            task_timeout: Duration::from_secs(60),
            max_concurrent: 4,
            recurrence_tick: Duration::from_secs(5),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            error_backoff_max: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// `<hostname>-<8 hex chars>`, so restarts on the same host never reuse an
/// identity still recorded on stale locks.
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

/// File form. Durations are integers with the unit in the key.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkerSection {
    worker_id: Option<String>,
    batch_size: Option<usize>,
    poll_interval_ms: Option<u64>,
    lock_timeout_secs: Option<u64>,
    task_timeout_secs: Option<u64>,
    max_concurrent: Option<usize>,
    recurrence_tick_ms: Option<u64>,
    default_max_attempts: Option<u32>,
    error_backoff_max_secs: Option<u64>,
    #[serde(default)]
    retry: RetrySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetrySection {
    base_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    max_delay_secs: Option<u64>,
    jitter: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    worker: WorkerSection,
}

impl WorkerSection {
    fn from_env() -> Result<Self> {
        Ok(Self {
            worker_id: optional_var("TASKPROC_WORKER_ID")?,
            batch_size: optional_var("TASKPROC_BATCH_SIZE")?,
            poll_interval_ms: optional_var("TASKPROC_POLL_INTERVAL_MS")?,
            lock_timeout_secs: optional_var("TASKPROC_LOCK_TIMEOUT_SECS")?,
            task_timeout_secs: optional_var("TASKPROC_TASK_TIMEOUT_SECS")?,
            max_concurrent: optional_var("TASKPROC_MAX_CONCURRENT")?,
            recurrence_tick_ms: optional_var("TASKPROC_RECURRENCE_TICK_MS")?,
            default_max_attempts: optional_var("TASKPROC_DEFAULT_MAX_ATTEMPTS")?,
            error_backoff_max_secs: optional_var("TASKPROC_ERROR_BACKOFF_MAX_SECS")?,
            retry: RetrySection {
                base_delay_ms: optional_var("TASKPROC_RETRY_BASE_DELAY_MS")?,
                multiplier: optional_var("TASKPROC_RETRY_MULTIPLIER")?,
                max_delay_secs: optional_var("TASKPROC_RETRY_MAX_DELAY_SECS")?,
                jitter: optional_var("TASKPROC_RETRY_JITTER")?,
            },
        })
    }

    fn apply(self, mut config: WorkerConfig) -> WorkerConfig {
        if let Some(v) = self.worker_id {
            config.worker_id = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = self.lock_timeout_secs {
            config.lock_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.task_timeout_secs {
            config.task_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.max_concurrent {
            config.max_concurrent = v;
        }
        if let Some(v) = self.recurrence_tick_ms {
            config.recurrence_tick = Duration::from_millis(v);
        }
        if let Some(v) = self.default_max_attempts {
            config.default_max_attempts = v;
        }
        if let Some(v) = self.error_backoff_max_secs {
            config.error_backoff_max = Duration::from_secs(v);
        }
        if let Some(v) = self.retry.base_delay_ms {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.retry.multiplier {
            config.retry.multiplier = v;
        }
        if let Some(v) = self.retry.max_delay_secs {
            config.retry.max_delay = Duration::from_secs(v);
        }
        if let Some(v) = self.retry.jitter {
            config.retry.jitter = v;
        }
        config
    }
}

impl WorkerConfig {
    /// Defaults overridden by any `TASKPROC_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        let config = WorkerSection::from_env()?.apply(Self::default());
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the `[worker]` table of a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read worker config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad worker config {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let config = file.worker.apply(Self::default());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(Error::Config("worker_id must not be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(Error::Config("max_concurrent must be at least 1".to_string()));
        }
        if self.default_max_attempts == 0 {
            return Err(Error::Config(
                "default_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(Error::Config("lock_timeout must be positive".to_string()));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Config(format!(
                "retry jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        if self.lock_timeout > MAX_LOCK_TIMEOUT {
            return Err(Error::Config(format!(
                "lock_timeout must be at most {}s, got {}s",
                MAX_LOCK_TIMEOUT.as_secs(),
                self.lock_timeout.as_secs()
            )));
        }
        // A claimed batch runs in waves of `max_concurrent`, each wave up to
        // `task_timeout`. The last task must finish before its lock is stale.
        let waves = self.batch_size.div_ceil(self.max_concurrent);
        let longest_hold = u32::try_from(waves)
            .ok()
            .and_then(|w| self.task_timeout.checked_mul(w))
            .unwrap_or(Duration::MAX);
        if self.lock_timeout <= longest_hold {
            return Err(Error::Config(format!(
                "lock_timeout ({}s) must exceed task_timeout ({}s) times {waves} execution waves \
                 (batch_size {} over max_concurrent {})",
                self.lock_timeout.as_secs(),
                self.task_timeout.as_secs(),
                self.batch_size,
                self.max_concurrent
            )));
        }
        Ok(())
    }

    /// `lock_timeout` as used in store timestamps.
    pub fn lock_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lock_timeout.min(MAX_LOCK_TIMEOUT))
            .unwrap_or(chrono::Duration::MAX)
    }
}
