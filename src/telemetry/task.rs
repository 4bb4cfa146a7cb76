//! Task execution span helpers.

use tracing::Span;

use crate::model::task::TaskId;

/// Start a span covering one execution attempt of a task.
///
/// The `task.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_task_span(action: &str, task_id: &TaskId, attempt: u32) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.action" = action,
        "task.id" = %task_id,
        "task.attempt" = attempt,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit an event scoped to it.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
