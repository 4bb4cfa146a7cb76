//! Built-in actions shipped with the `taskproc` binary.
//!
//! Real deployments register their own handlers; these exist so a fresh
//! install can be exercised end to end from the CLI.

use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::error::Result;
use crate::registry::{ActionRegistry, PermanentFailure};

/// Longest pause the `sleep` action accepts.
const MAX_SLEEP: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
struct LogArgs {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SleepArgs {
    ms: u64,
}

/// Register `noop`, `log` and `sleep`.
pub fn register_builtin(registry: &mut ActionRegistry) -> Result<()> {
    registry.register_fn("noop", |_args: Value| async { anyhow::Ok(()) })?;

    registry.register_fn("log", |args: Value| async move {
        let args: LogArgs = serde_json::from_value(args)
            .map_err(|e| PermanentFailure::new(format!("log: bad arguments: {e}")))?;
        info!(message = %args.message, "log action");
        anyhow::Ok(())
    })?;

    registry.register_fn("sleep", |args: Value| async move {
        let args: SleepArgs = serde_json::from_value(args)
            .context("sleep: expected {\"ms\": <integer>}")
            .map_err(|e| PermanentFailure::new(format!("{e:#}")))?;
        let pause = Duration::from_millis(args.ms);
        if pause > MAX_SLEEP {
            return Err(PermanentFailure::new(format!("sleep: {}ms exceeds one hour", args.ms)).into());
        }
        tokio::time::sleep(pause).await;
        anyhow::Ok(())
    })?;

    Ok(())
}
