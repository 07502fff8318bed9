//! Task execution span helpers.
//!
//! Every attempt of a task runs inside a `task.execute` span. Attempts of
//! the same lineage (an original submission and its retries) share a
//! `task.lineage` id so they can be correlated in a trace backend.

use tracing::Span;
use uuid::Uuid;

/// Start a span for one attempt of a task.
///
/// The `task.outcome` field is declared empty and filled in via
/// [`record_outcome`].
pub fn start_task_span(name: &str, lineage: &Uuid, attempt: u32) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.name" = name,
        "task.lineage" = %lineage,
        "task.attempt" = attempt,
        "task.outcome" = tracing::field::Empty,
    )
}

/// Record how an attempt ended on its span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("task.outcome", outcome);
}
