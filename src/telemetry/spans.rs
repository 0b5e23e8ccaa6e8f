//! Span helpers for the ingestion path and lifecycle transitions.

use tracing::Span;

use crate::model::{ExecutionId, Source};

/// Start a span covering one emit call.
///
/// `event.sequence` and `event.outcome` are declared empty and filled in
/// once the record has been persisted or dropped.
pub fn start_emit_span(source: Source, entry_type: &str) -> Span {
    tracing::debug_span!(
        "event.emit",
        "event.source" = source.as_str(),
        "event.entry_type" = entry_type,
        "event.sequence" = tracing::field::Empty,
        "event.outcome" = tracing::field::Empty,
    )
}

/// Start a span for a lifecycle operation on an execution.
pub fn start_lifecycle_span(operation: &str, execution_id: Option<ExecutionId>) -> Span {
    match execution_id {
        Some(id) => tracing::info_span!(
            "lifecycle",
            "lifecycle.operation" = operation,
            "execution.id" = %id,
        ),
        None => tracing::info_span!(
            "lifecycle",
            "lifecycle.operation" = operation,
            "execution.id" = tracing::field::Empty,
        ),
    }
}

/// Record a state transition event on the given span.
pub fn record_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
