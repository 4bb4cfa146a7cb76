//! taskproc CLI: run a worker, submit and inspect tasks, manage recurring
//! definitions.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use taskproc::actions::register_builtin;
use taskproc::config::secrets::redact_url;
use taskproc::config::{Config, WorkerConfig};
use taskproc::db::Db;
use taskproc::engine::Worker;
use taskproc::model::recurring::{Interval, NewRecurringTask, RecurringTaskId};
use taskproc::model::task::{NewTask, TaskId, TaskState};
use taskproc::registry::ActionRegistry;
use taskproc::store::{TaskFilter, TaskStore, submit};
use taskproc::telemetry::{TelemetryConfig, init_telemetry};
use tracing::info;

#[derive(Parser)]
#[command(name = "taskproc", about = "Durable multi-worker task queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker: claim and execute tasks, expand recurring definitions
    Serve {
        /// TOML file with a [worker] table; TASKPROC_* variables otherwise
        #[arg(long)]
        config: Option<PathBuf>,
        /// Only dispatch tasks; leave recurring definitions to other workers
        #[arg(long)]
        no_recurrence: bool,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },
    /// Recurring definition operations
    Recurring {
        #[command(subcommand)]
        action: RecurringCommand,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Enqueue a task
    Enqueue {
        /// Registered action name
        action: String,
        /// JSON arguments
        #[arg(long)]
        args: Option<String>,
        /// Priority (higher = claimed first)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Attempts before the task is abandoned
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Not eligible until this many seconds from now
        #[arg(long)]
        delay_secs: Option<i64>,
    },
    /// List tasks, newest first
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Filter by action name
        #[arg(long)]
        action: Option<String>,
        /// Maximum tasks to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a task and its run history
    Show {
        /// Task ID (full UUID or the short form shown by `task list`)
        id: String,
    },
    /// Count tasks by state
    Counts,
    /// Delete successful tasks older than a cutoff
    Purge {
        /// Age in days
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
    },
}

#[derive(Subcommand)]
enum RecurringCommand {
    /// Create a recurring definition
    Create {
        /// Registered action name
        action: String,
        /// "90s", "15m", "2h", "1d", or "cron:<expr>"
        interval: String,
        /// JSON arguments for every spawned task
        #[arg(long)]
        args: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Create disabled
        #[arg(long)]
        disabled: bool,
    },
    /// List recurring definitions
    List,
    /// Resume expansion
    Enable { id: String },
    /// Halt expansion; history is kept
    Disable { id: String },
    /// Change the interval
    SetInterval { id: String, interval: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            no_recurrence,
        } => cmd_serve(config, no_recurrence).await,
        Command::Task { action } => {
            let db = connect().await?;
            match action {
                TaskCommand::Enqueue {
                    action,
                    args,
                    priority,
                    max_attempts,
                    delay_secs,
                } => cmd_task_enqueue(&db, action, args, priority, max_attempts, delay_secs).await,
                TaskCommand::List {
                    state,
                    action,
                    limit,
                } => cmd_task_list(&db, state, action, limit).await,
                TaskCommand::Show { id } => cmd_task_show(&db, id).await,
                TaskCommand::Counts => cmd_task_counts(&db).await,
                TaskCommand::Purge { older_than_days } => cmd_task_purge(&db, older_than_days).await,
            }
        }
        Command::Recurring { action } => {
            let db = connect().await?;
            match action {
                RecurringCommand::Create {
                    action,
                    interval,
                    args,
                    priority,
                    max_attempts,
                    disabled,
                } => {
                    cmd_recurring_create(&db, action, interval, args, priority, max_attempts, disabled)
                        .await
                }
                RecurringCommand::List => cmd_recurring_list(&db).await,
                RecurringCommand::Enable { id } => cmd_recurring_enabled(&db, id, true).await,
                RecurringCommand::Disable { id } => cmd_recurring_enabled(&db, id, false).await,
                RecurringCommand::SetInterval { id, interval } => {
                    cmd_recurring_set_interval(&db, id, interval).await
                }
            }
        }
    }
}

async fn connect() -> anyhow::Result<Db> {
    let config = Config::from_env()?;
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

fn parse_args(args: Option<String>) -> anyhow::Result<serde_json::Value> {
    Ok(match args {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    })
}

async fn cmd_serve(config_path: Option<PathBuf>, no_recurrence: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    let worker_config = match config_path {
        Some(path) => WorkerConfig::from_toml_file(&path)?,
        None => WorkerConfig::from_env()?,
    };

    info!(database = %redact_url(&config.database_url), "connecting");
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    db.health_check().await?;

    let mut registry = ActionRegistry::empty();
    register_builtin(&mut registry)?;
    info!(actions = ?registry.names(), "actions registered");

    let store: Arc<dyn TaskStore> = Arc::new(db);
    let worker = Worker::spawn_with(store, Arc::new(registry), worker_config, !no_recurrence);

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, finishing in-flight tasks");
    worker.shutdown_and_join().await;
    Ok(())
}

async fn cmd_task_enqueue(
    db: &Db,
    action: String,
    args: Option<String>,
    priority: i32,
    max_attempts: Option<u32>,
    delay_secs: Option<i64>,
) -> anyhow::Result<()> {
    let defaults = WorkerConfig::from_env()?;
    let mut new = NewTask::new(action)
        .args(parse_args(args)?)
        .priority(priority)
        .max_attempts(max_attempts.unwrap_or(defaults.default_max_attempts));
    if let Some(secs) = delay_secs {
        let at = chrono::Duration::try_seconds(secs)
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or_else(|| anyhow::anyhow!("--delay-secs {secs} is out of range"))?;
        new = new.scheduled_for(at);
    }

    let id = submit(db, new).await?;
    println!("Enqueued: {id}");
    Ok(())
}

async fn cmd_task_list(
    db: &Db,
    state: Option<String>,
    action: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let state: Option<TaskState> = match state {
        Some(s) => Some(s.parse()?),
        None => None,
    };
    let tasks = db
        .list_tasks(&TaskFilter {
            state,
            action_name: action,
            limit: Some(limit),
        })
        .await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<9}  {:<4}  {:<5}  {:<16}  CREATED",
        "ID", "ACTION", "STATE", "PRI", "TRIES", "SCHEDULED"
    );
    println!("{}", "-".repeat(96));
    for task in &tasks {
        println!(
            "{:<8}  {:<20}  {:<9}  {:<4}  {:<5}  {:<16}  {}",
            task.id.short(),
            task.action_name,
            task.state,
            task.priority,
            format!("{}/{}", task.attempts, task.max_attempts),
            task.scheduled_for.format("%Y-%m-%d %H:%M"),
            task.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} task(s)", tasks.len());
    Ok(())
}

/// Resolve a full id or a unique short id among recent tasks.
async fn resolve_task_id(db: &Db, id: &str) -> anyhow::Result<TaskId> {
    if let Ok(id) = id.parse() {
        return Ok(id);
    }
    let recent = db
        .list_tasks(&TaskFilter {
            limit: Some(500),
            ..Default::default()
        })
        .await?;
    let matches: Vec<TaskId> = recent
        .iter()
        .map(|t| t.id)
        .filter(|t| t.matches_short(id))
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("no task matching '{id}'"),
        [one] => Ok(*one),
        many => anyhow::bail!("{} tasks match '{id}', be more specific", many.len()),
    }
}

async fn cmd_task_show(db: &Db, id: String) -> anyhow::Result<()> {
    let id = resolve_task_id(db, &id).await?;
    let task = db.get_task(id).await?;

    println!("ID:         {}", task.id);
    println!("Action:     {}", task.action_name);
    println!("State:      {}", task.state);
    println!("Priority:   {}", task.priority);
    println!("Args:       {}", serde_json::to_string_pretty(&task.args)?);
    println!("Scheduled:  {}", task.scheduled_for);
    println!("Attempts:   {}/{}", task.attempts, task.max_attempts);
    if let (Some(by), Some(at)) = (&task.locked_by, task.locked_at) {
        println!("Locked:     by {by} at {at}");
    }
    if let Some(ref err) = task.last_error {
        println!("Last Error: {err}");
    }
    println!("Created:    {}", task.created_at);
    println!("Updated:    {}", task.updated_at);

    let runs = db.task_runs(id).await?;
    if !runs.is_empty() {
        println!("---");
        for run in &runs {
            println!(
                "#{:<3} {:<8} {:>7}ms  {}  {}",
                run.attempt,
                run.result,
                run.duration_ms(),
                run.worker_id,
                run.error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

async fn cmd_task_counts(db: &Db) -> anyhow::Result<()> {
    let counts = db.counts().await?;
    println!("pending:    {}", counts.pending);
    println!("locked:     {}", counts.locked);
    println!("success:    {}", counts.success);
    println!("failed:     {}", counts.failed);
    println!("abandoned:  {}", counts.abandoned);
    println!("total:      {}", counts.total());
    Ok(())
}

async fn cmd_task_purge(db: &Db, older_than_days: i64) -> anyhow::Result<()> {
    let before = chrono::Duration::try_days(older_than_days)
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .ok_or_else(|| anyhow::anyhow!("--older-than-days {older_than_days} is out of range"))?;
    let deleted = db.purge_succeeded(before).await?;
    println!("Purged {deleted} successful task(s) created before {before}");
    Ok(())
}

async fn cmd_recurring_create(
    db: &Db,
    action: String,
    interval: String,
    args: Option<String>,
    priority: i32,
    max_attempts: Option<u32>,
    disabled: bool,
) -> anyhow::Result<()> {
    let interval: Interval = interval.parse()?;
    let defaults = WorkerConfig::from_env()?;
    let new = NewRecurringTask::new(action, interval)
        .args(parse_args(args)?)
        .priority(priority)
        .max_attempts(max_attempts.unwrap_or(defaults.default_max_attempts))
        .enabled(!disabled);

    let id = db.create_recurring(new, Utc::now()).await?;
    println!("Created: {id}");
    Ok(())
}

async fn cmd_recurring_list(db: &Db) -> anyhow::Result<()> {
    let definitions = db.list_recurring().await?;
    if definitions.is_empty() {
        println!("No recurring definitions.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<20}  {:<7}  {:<16}  NEXT",
        "ID", "ACTION", "INTERVAL", "ENABLED", "LAST RUN"
    );
    println!("{}", "-".repeat(124));
    for d in &definitions {
        let last_run = d
            .last_run
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<20}  {:<20}  {:<7}  {:<16}  {}",
            d.id,
            d.action_name,
            d.interval.to_string(),
            d.enabled,
            last_run,
            d.next_run_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn cmd_recurring_enabled(db: &Db, id: String, enabled: bool) -> anyhow::Result<()> {
    let id: RecurringTaskId = id.parse()?;
    let definition = db.set_recurring_enabled(id, enabled, Utc::now()).await?;
    println!(
        "{}: {}",
        definition.id,
        if definition.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

async fn cmd_recurring_set_interval(db: &Db, id: String, interval: String) -> anyhow::Result<()> {
    let id: RecurringTaskId = id.parse()?;
    let interval: Interval = interval.parse()?;
    let definition = db.set_recurring_interval(id, interval, Utc::now()).await?;
    println!(
        "{}: {}, next run {}",
        definition.id, definition.interval, definition.next_run_at
    );
    Ok(())
}
