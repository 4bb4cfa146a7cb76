//! Integration tests for recurring definitions and the recurrence expander.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use taskproc::config::WorkerConfig;
use taskproc::engine::RecurrenceExpander;
use taskproc::error::Error;
use taskproc::model::recurring::{Interval, MAX_PERIOD, NewRecurringTask};
use taskproc::model::task::TaskState;
use taskproc::store::{ExpandRequest, MemoryStore, TaskFilter, TaskStore};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

fn expander(store: &Arc<MemoryStore>, holder: &str) -> RecurrenceExpander {
    let config = WorkerConfig {
        worker_id: holder.to_string(),
        lock_timeout: StdDuration::from_secs(300),
        ..WorkerConfig::default()
    };
    let store: Arc<dyn TaskStore> = store.clone();
    RecurrenceExpander::new(store, config)
}

fn every(secs: u64) -> Interval {
    Interval::every(StdDuration::from_secs(secs)).unwrap()
}

#[tokio::test]
async fn fires_once_per_interval() {
    let store = Arc::new(MemoryStore::new());
    let id = store
        .create_recurring(
            NewRecurringTask::new("report", every(3600)).args(json!({"kind": "daily"})),
            t0(),
        )
        .await
        .unwrap();
    let exp = expander(&store, "w1");

    let half = Duration::minutes(30);
    let mut fired = Vec::new();
    for k in 0..4 {
        fired.extend(exp.tick(t0() + half * k).await.unwrap());
    }
    assert_eq!(fired.len(), 2);

    let first = store.get_task(fired[0]).await.unwrap();
    let second = store.get_task(fired[1]).await.unwrap();
    assert_eq!(first.scheduled_for, t0());
    assert_eq!(second.scheduled_for, t0() + Duration::hours(1));
    assert_eq!(first.action_name, "report");
    assert_eq!(first.args, json!({"kind": "daily"}));
    assert_eq!(first.state, TaskState::Pending);

    let definition = store.get_recurring(id).await.unwrap();
    assert_eq!(definition.last_run, Some(t0() + Duration::hours(1)));
    assert_eq!(definition.next_run_at, t0() + Duration::hours(2));
    assert!(!definition.is_locked);

    let runs = store.recurring_runs(id).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].task_id, fired[0]);
    assert_eq!(runs[1].fired_at, t0() + Duration::hours(1));
}

#[tokio::test]
async fn spawned_tasks_inherit_priority_and_attempts() {
    let store = Arc::new(MemoryStore::new());
    store
        .create_recurring(
            NewRecurringTask::new("sync", every(60)).priority(7).max_attempts(9),
            t0(),
        )
        .await
        .unwrap();

    let fired = expander(&store, "w1").tick(t0()).await.unwrap();
    let task = store.get_task(fired[0]).await.unwrap();
    assert_eq!(task.priority, 7);
    assert_eq!(task.max_attempts, 9);
}

#[tokio::test]
async fn disabling_halts_expansion_and_keeps_history() {
    let store = Arc::new(MemoryStore::new());
    let id = store
        .create_recurring(NewRecurringTask::new("report", every(60)), t0())
        .await
        .unwrap();
    let exp = expander(&store, "w1");
    assert_eq!(exp.tick(t0()).await.unwrap().len(), 1);

    store
        .set_recurring_enabled(id, false, t0() + Duration::seconds(10))
        .await
        .unwrap();
    for minutes in 1..5 {
        assert!(exp.tick(t0() + Duration::minutes(minutes)).await.unwrap().is_empty());
    }
    assert_eq!(store.recurring_runs(id).await.unwrap().len(), 1);
    assert_eq!(store.counts().await.unwrap().total(), 1);

    store
        .set_recurring_enabled(id, true, t0() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(exp.tick(t0() + Duration::minutes(5)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn created_disabled_never_fires() {
    let store = Arc::new(MemoryStore::new());
    store
        .create_recurring(NewRecurringTask::new("report", every(60)).enabled(false), t0())
        .await
        .unwrap();
    assert!(expander(&store, "w1").tick(t0() + Duration::hours(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn live_definition_lock_blocks_other_expanders_until_stale() {
    let store = Arc::new(MemoryStore::new());
    let id = store
        .create_recurring(NewRecurringTask::new("report", every(60)), t0())
        .await
        .unwrap();

    // An expander that locks the definition and then dies.
    let locked = store
        .lock_due_recurring(&ExpandRequest {
            holder: "crashed".to_string(),
            now: t0(),
            lock_timeout: Duration::minutes(5),
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(locked.len(), 1);

    let exp = expander(&store, "w2");
    assert!(exp.tick(t0() + Duration::minutes(1)).await.unwrap().is_empty());

    let fired = exp.tick(t0() + Duration::minutes(6)).await.unwrap();
    assert_eq!(fired.len(), 1);

    // The crashed holder lost the lock and cannot fire a second time.
    let err = store
        .materialize_recurring(id, "crashed", t0() + Duration::minutes(6))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RecurringLockLost { .. }), "got {err:?}");
    assert_eq!(store.recurring_runs(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn released_definition_can_be_expanded_again() {
    let store = Arc::new(MemoryStore::new());
    let id = store
        .create_recurring(NewRecurringTask::new("report", every(60)), t0())
        .await
        .unwrap();
    let req = ExpandRequest {
        holder: "w1".to_string(),
        now: t0(),
        lock_timeout: Duration::minutes(5),
        limit: 10,
    };
    assert_eq!(store.lock_due_recurring(&req).await.unwrap().len(), 1);
    assert!(store.lock_due_recurring(&req).await.unwrap().is_empty());

    // Releasing for another holder is a no-op.
    store.release_recurring(id, "someone-else").await.unwrap();
    assert!(store.get_recurring(id).await.unwrap().is_locked);

    store.release_recurring(id, "w1").await.unwrap();
    assert_eq!(store.lock_due_recurring(&req).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cron_definitions_fire_on_schedule() {
    let store = Arc::new(MemoryStore::new());
    let created = t0() + Duration::minutes(30); // 12:30
    let id = store
        .create_recurring(
            NewRecurringTask::new("hourly", Interval::cron("0 * * * *").unwrap()),
            created,
        )
        .await
        .unwrap();
    assert_eq!(
        store.get_recurring(id).await.unwrap().next_run_at,
        t0() + Duration::hours(1)
    );

    let exp = expander(&store, "w1");
    let mut fired = 0;
    for minutes in [45, 60, 90, 120] {
        fired += exp.tick(t0() + Duration::minutes(minutes)).await.unwrap().len();
    }
    assert_eq!(fired, 2);
    assert_eq!(
        store.get_recurring(id).await.unwrap().next_run_at,
        t0() + Duration::hours(3)
    );
}

#[tokio::test]
async fn changing_the_interval_recomputes_next_run() {
    let store = Arc::new(MemoryStore::new());
    let id = store
        .create_recurring(NewRecurringTask::new("report", every(3600)), t0())
        .await
        .unwrap();
    let exp = expander(&store, "w1");
    exp.tick(t0()).await.unwrap();

    let updated = store
        .set_recurring_interval(id, every(600), t0() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(updated.next_run_at, t0() + Duration::minutes(10));
    assert_eq!(updated.interval, every(600));

    assert_eq!(exp.tick(t0() + Duration::minutes(10)).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_expanders_fire_each_definition_once() {
    let store = Arc::new(MemoryStore::new());
    let mut ids = Vec::new();
    for i in 0..20 {
        let id = store
            .create_recurring(NewRecurringTask::new(format!("job-{i}"), every(60)), t0())
            .await
            .unwrap();
        ids.push(id);
    }

    let mut handles = Vec::new();
    for holder in ["w1", "w2", "w3"] {
        let exp = expander(&store, holder);
        handles.push(tokio::spawn(async move { exp.tick(t0()).await.unwrap() }));
    }
    let mut fired = Vec::new();
    for handle in handles {
        fired.extend(handle.await.unwrap());
    }

    assert_eq!(fired.len(), 20);
    assert_eq!(fired.iter().collect::<HashSet<_>>().len(), 20);
    for id in ids {
        assert_eq!(store.recurring_runs(id).await.unwrap().len(), 1);
    }
    let tasks = store.list_tasks(&TaskFilter::default()).await.unwrap();
    assert_eq!(tasks.len(), 20);
}

#[tokio::test]
async fn out_of_range_intervals_are_rejected_up_front() {
    let store = Arc::new(MemoryStore::new());
    let huge = Interval::Every {
        period: StdDuration::from_secs(99_999_999 * 86_400),
    };
    let err = store
        .create_recurring(NewRecurringTask::new("noop", huge.clone()), t0())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTask(_)), "got {err:?}");

    let id = store
        .create_recurring(NewRecurringTask::new("noop", every(60)), t0())
        .await
        .unwrap();
    assert!(store.set_recurring_interval(id, huge, t0()).await.is_err());
    let fractional = Interval::Every {
        period: StdDuration::from_millis(1500),
    };
    assert!(store.set_recurring_interval(id, fractional, t0()).await.is_err());
    assert_eq!(store.get_recurring(id).await.unwrap().interval, every(60));
}

#[tokio::test]
async fn unrepresentable_next_run_releases_the_definition() {
    let store = Arc::new(MemoryStore::new());
    let near_end = DateTime::<Utc>::MAX_UTC - Duration::days(1);
    let id = store
        .create_recurring(
            NewRecurringTask::new("noop", Interval::every(MAX_PERIOD).unwrap()),
            near_end,
        )
        .await
        .unwrap();

    let exp = expander(&store, "w1");
    let fired = tokio::spawn(async move { exp.tick(near_end).await })
        .await
        .expect("expander tick must not panic")
        .unwrap();
    assert!(fired.is_empty());

    let definition = store.get_recurring(id).await.unwrap();
    assert!(!definition.is_locked);
    assert!(definition.last_run.is_none());
    assert!(store.recurring_runs(id).await.unwrap().is_empty());
}
