//! Integration tests for the dispatcher and worker loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use taskproc::config::{RetryConfig, WorkerConfig};
use taskproc::engine::{Dispatcher, Worker};
use taskproc::model::task::{NewTask, RunResult, TaskId, TaskState};
use taskproc::registry::{ActionRegistry, PermanentFailure, TaskAction};
use taskproc::store::{MemoryStore, TaskStore, submit};

fn test_config(worker_id: &str) -> WorkerConfig {
    WorkerConfig {
        worker_id: worker_id.to_string(),
        batch_size: 10,
        poll_interval: Duration::from_millis(10),
        lock_timeout: Duration::from_secs(300),
        task_timeout: Duration::from_secs(5),
        max_concurrent: 4,
        recurrence_tick: Duration::from_millis(10),
        default_max_attempts: 3,
        error_backoff_max: Duration::from_millis(100),
        retry: RetryConfig {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        },
    }
}

fn dispatcher(store: &Arc<MemoryStore>, registry: ActionRegistry, config: WorkerConfig) -> Dispatcher {
    let store: Arc<dyn TaskStore> = store.clone();
    Dispatcher::new(store, Arc::new(registry), config)
}

struct Explode;

#[async_trait]
impl TaskAction for Explode {
    async fn run(&self, _args: &Value) -> anyhow::Result<()> {
        panic!("kaboom");
    }
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_action_ends_in_success() {
    let store = Arc::new(MemoryStore::new());
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut registry = ActionRegistry::empty();
    let s = Arc::clone(&seen);
    registry
        .register_fn("record", move |args: Value| {
            let s = Arc::clone(&s);
            async move {
                s.lock().unwrap().push(args);
                anyhow::Ok(())
            }
        })
        .unwrap();

    let id = submit(store.as_ref(), NewTask::new("record").args(json!({"n": 7})))
        .await
        .unwrap();

    let d = dispatcher(&store, registry, test_config("w1"));
    assert_eq!(d.run_once().await.unwrap(), 1);
    assert_eq!(d.run_once().await.unwrap(), 0);

    let task = store.get_task(id).await.unwrap();
    assert_eq!(task.state, TaskState::Success);
    assert_eq!(task.attempts, 1);
    assert_eq!(seen.lock().unwrap().as_slice(), &[json!({"n": 7})]);

    let runs = store.task_runs(id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].worker_id, "w1");
    assert_eq!(runs[0].result, RunResult::Success);
}

#[tokio::test]
async fn fails_until_last_attempt_then_succeeds() {
    let store = Arc::new(MemoryStore::new());
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ActionRegistry::empty();
    let c = Arc::clone(&calls);
    registry
        .register_fn("flaky", move |_args: Value| {
            let c = Arc::clone(&c);
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    anyhow::bail!("transient failure {n}");
                }
                anyhow::Ok(())
            }
        })
        .unwrap();

    let id = submit(store.as_ref(), NewTask::new("flaky").max_attempts(3))
        .await
        .unwrap();
    let d = dispatcher(&store, registry, test_config("w1"));

    for attempt in 1..=3u32 {
        assert_eq!(d.run_once().await.unwrap(), 1, "attempt {attempt}");
        let task = store.get_task(id).await.unwrap();
        assert_eq!(task.attempts, attempt);
    }

    let task = store.get_task(id).await.unwrap();
    assert_eq!(task.state, TaskState::Success);
    assert_eq!(task.attempts, task.max_attempts);
    assert_eq!(task.last_error.as_deref(), Some("transient failure 2"));

    let results: Vec<RunResult> = store
        .task_runs(id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.result)
        .collect();
    assert_eq!(
        results,
        vec![RunResult::Failure, RunResult::Failure, RunResult::Success]
    );
}

#[tokio::test]
async fn exhausting_attempts_abandons_the_task() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = ActionRegistry::empty();
    registry
        .register_fn("broken", |_args: Value| async {
            Err::<(), _>(anyhow::anyhow!("always fails"))
        })
        .unwrap();

    let id = submit(store.as_ref(), NewTask::new("broken").max_attempts(3))
        .await
        .unwrap();
    let d = dispatcher(&store, registry, test_config("w1"));

    for _ in 0..3 {
        assert_eq!(d.run_once().await.unwrap(), 1);
    }
    assert_eq!(d.run_once().await.unwrap(), 0);

    let task = store.get_task(id).await.unwrap();
    assert_eq!(task.state, TaskState::Abandoned);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.last_error.as_deref(), Some("always fails"));
    assert_eq!(store.task_runs(id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn unknown_action_is_abandoned_without_retry() {
    let store = Arc::new(MemoryStore::new());
    let id = submit(store.as_ref(), NewTask::new("does-not-exist").max_attempts(5))
        .await
        .unwrap();
    let d = dispatcher(&store, ActionRegistry::empty(), test_config("w1"));

    assert_eq!(d.run_once().await.unwrap(), 1);
    assert_eq!(d.run_once().await.unwrap(), 0);

    let task = store.get_task(id).await.unwrap();
    assert_eq!(task.state, TaskState::Abandoned);
    assert_eq!(task.attempts, 1);
    assert!(task.last_error.unwrap().contains("unknown action"));
}

#[tokio::test]
async fn permanent_failure_is_abandoned_without_retry() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = ActionRegistry::empty();
    registry
        .register_fn("strict", |_args: Value| async {
            Err::<(), anyhow::Error>(PermanentFailure::new("malformed input").into())
        })
        .unwrap();

    let id = submit(store.as_ref(), NewTask::new("strict").max_attempts(5))
        .await
        .unwrap();
    let d = dispatcher(&store, registry, test_config("w1"));
    d.run_once().await.unwrap();

    let task = store.get_task(id).await.unwrap();
    assert_eq!(task.state, TaskState::Abandoned);
    assert_eq!(task.attempts, 1);
    assert!(task.last_error.unwrap().contains("malformed input"));
}

#[tokio::test]
async fn slow_action_times_out() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = ActionRegistry::empty();
    registry
        .register_fn("slow", |_args: Value| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            anyhow::Ok(())
        })
        .unwrap();

    let id = submit(store.as_ref(), NewTask::new("slow").max_attempts(1))
        .await
        .unwrap();
    let mut config = test_config("w1");
    config.task_timeout = Duration::from_millis(50);
    let d = dispatcher(&store, registry, config);
    d.run_once().await.unwrap();

    let task = store.get_task(id).await.unwrap();
    assert_eq!(task.state, TaskState::Abandoned);
    assert!(task.last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn panicking_action_does_not_crash_the_dispatcher() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = ActionRegistry::empty();
    registry.register("explode", Arc::new(Explode)).unwrap();
    registry
        .register_fn("noop", |_args: Value| async { anyhow::Ok(()) })
        .unwrap();

    let bad = submit(store.as_ref(), NewTask::new("explode").max_attempts(2))
        .await
        .unwrap();
    let good = submit(store.as_ref(), NewTask::new("noop")).await.unwrap();

    let d = dispatcher(&store, registry, test_config("w1"));
    assert_eq!(d.run_once().await.unwrap(), 2);

    let bad = store.get_task(bad).await.unwrap();
    assert_eq!(bad.state, TaskState::Pending);
    assert!(bad.last_error.unwrap().contains("kaboom"));
    assert_eq!(store.get_task(good).await.unwrap().state, TaskState::Success);
}

#[tokio::test]
async fn retry_waits_for_backoff() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = ActionRegistry::empty();
    registry
        .register_fn("broken", |_args: Value| async {
            Err::<(), _>(anyhow::anyhow!("nope"))
        })
        .unwrap();

    let id = submit(store.as_ref(), NewTask::new("broken")).await.unwrap();
    let mut config = test_config("w1");
    config.retry = RetryConfig {
        base_delay: Duration::from_secs(60),
        multiplier: 2.0,
        max_delay: Duration::from_secs(600),
        jitter: 0.0,
    };
    let d = dispatcher(&store, registry, config);

    assert_eq!(d.run_once().await.unwrap(), 1);
    assert_eq!(d.run_once().await.unwrap(), 0);

    let task = store.get_task(id).await.unwrap();
    assert_eq!(task.state, TaskState::Pending);
    let runs = store.task_runs(id).await.unwrap();
    let delay = task.scheduled_for - runs[0].finished_at;
    assert_eq!(delay, chrono::Duration::seconds(60));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn execution_is_bounded_by_max_concurrent() {
    let store = Arc::new(MemoryStore::new());
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = ActionRegistry::empty();
    let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
    registry
        .register_fn("busy", move |_args: Value| {
            let (r, p) = (Arc::clone(&r), Arc::clone(&p));
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
        .unwrap();

    for _ in 0..6 {
        submit(store.as_ref(), NewTask::new("busy")).await.unwrap();
    }
    let mut config = test_config("w1");
    config.max_concurrent = 2;
    let d = dispatcher(&store, registry, config);

    assert_eq!(d.run_once().await.unwrap(), 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(store.counts().await.unwrap().success, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_workers_execute_each_task_once() {
    let store = Arc::new(MemoryStore::new());
    let executions: Arc<std::sync::Mutex<HashMap<u64, u32>>> = Arc::default();
    let mut registry = ActionRegistry::empty();
    let e = Arc::clone(&executions);
    registry
        .register_fn("count", move |args: Value| {
            let e = Arc::clone(&e);
            async move {
                let n = args["n"].as_u64().unwrap_or_default();
                *e.lock().unwrap().entry(n).or_default() += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
                anyhow::Ok(())
            }
        })
        .unwrap();
    let registry = Arc::new(registry);

    for n in 0..50u64 {
        submit(store.as_ref(), NewTask::new("count").args(json!({"n": n})))
            .await
            .unwrap();
    }

    let workers: Vec<Worker> = ["w1", "w2"]
        .into_iter()
        .map(|id| {
            let mut config = test_config(id);
            config.batch_size = 3;
            let store: Arc<dyn TaskStore> = store.clone();
            Worker::spawn_with(store, Arc::clone(&registry), config, false)
        })
        .collect();

    eventually(|| {
        let store = Arc::clone(&store);
        async move { store.counts().await.unwrap().success == 50 }
    })
    .await;
    for worker in workers {
        worker.shutdown_and_join().await;
    }

    let executions = executions.lock().unwrap();
    assert_eq!(executions.len(), 50);
    assert!(executions.values().all(|&count| count == 1), "{executions:?}");
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_finishes_in_flight_tasks_and_stops_claiming() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = ActionRegistry::empty();
    registry
        .register_fn("slow", |_args: Value| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            anyhow::Ok(())
        })
        .unwrap();

    let first = submit(store.as_ref(), NewTask::new("slow")).await.unwrap();
    let dyn_store: Arc<dyn TaskStore> = store.clone();
    let worker = Worker::spawn(dyn_store, Arc::new(registry), test_config("w1"));

    eventually(|| {
        let store = Arc::clone(&store);
        async move { store.get_task(first).await.unwrap().state == TaskState::Locked }
    })
    .await;

    worker.shutdown_and_join().await;
    assert_eq!(store.get_task(first).await.unwrap().state, TaskState::Success);

    let second: TaskId = submit(store.as_ref(), NewTask::new("slow")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.get_task(second).await.unwrap().state, TaskState::Pending);
}
