//! Integration tests for telemetry initialization and span helpers.

use opentelemetry::KeyValue;
use taskproc::model::task::TaskId;
use taskproc::telemetry::{TelemetryConfig, init_telemetry, metrics, task};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Only one global subscriber per process; a second init may fail and
    // that is fine here.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "taskproc-test".to_string(),
        log_level: "debug".to_string(),
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn task_span_records_transition() {
    let id = TaskId::new();
    let span = task::start_task_span("send-email", &id, 2);
    let _enter = span.enter();
    task::record_state_transition(&span, "locked", "success");
}

#[test]
fn metric_instruments_accept_measurements() {
    // Without an installed provider these go to the no-op meter.
    metrics::task_enqueued().add(1, &[KeyValue::new("action", "noop")]);
    metrics::task_claimed().add(3, &[]);
    metrics::task_stale_reclaimed().add(1, &[]);
    metrics::task_outcomes().add(
        1,
        &[
            KeyValue::new("action", "noop"),
            KeyValue::new("outcome", "retry"),
        ],
    );
    metrics::task_duration_ms().record(12.5, &[KeyValue::new("action", "noop")]);
    metrics::recurring_fired().add(1, &[KeyValue::new("action", "noop")]);
    metrics::poll_errors().add(1, &[KeyValue::new("loop", "dispatcher")]);
}
