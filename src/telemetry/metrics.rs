//! Metric instrument factories for taskproc.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"taskproc"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for taskproc instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("taskproc")
}

/// Counter: tasks enqueued.
/// Labels: `action`.
pub fn task_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("taskproc.task.enqueued")
        .with_description("Number of tasks enqueued")
        .build()
}

/// Counter: tasks claimed, including reclaimed stale locks.
pub fn task_claimed() -> Counter<u64> {
    meter()
        .u64_counter("taskproc.task.claimed")
        .with_description("Number of tasks claimed by this worker")
        .build()
}

/// Counter: claims that took over a stale lock from another worker.
pub fn task_stale_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("taskproc.task.stale_reclaimed")
        .with_description("Number of stale task locks reclaimed")
        .build()
}

/// Counter: recorded attempt outcomes.
/// Labels: `action`, `outcome` ("success" | "retry" | "abandoned").
pub fn task_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("taskproc.task.outcomes")
        .with_description("Number of task attempts by outcome")
        .build()
}

/// Histogram: action execution time in milliseconds.
/// Labels: `action`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskproc.task.duration_ms")
        .with_description("Task action execution time in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: tasks spawned from recurring definitions.
pub fn recurring_fired() -> Counter<u64> {
    meter()
        .u64_counter("taskproc.recurring.fired")
        .with_description("Number of tasks materialized from recurring definitions")
        .build()
}

/// Counter: failed poll cycles.
/// Labels: `loop` ("dispatcher" | "recurrence").
pub fn poll_errors() -> Counter<u64> {
    meter()
        .u64_counter("taskproc.poll.errors")
        .with_description("Number of worker loop cycles that failed on the store")
        .build()
}
