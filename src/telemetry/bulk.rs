//! Bulk run span helpers.
//!
//! One span per bulk run, one child span per worker. Worker state
//! transitions are recorded as `trace` events inside the worker span.

use tracing::Span;

use crate::model::{BulkId, WorkerId};

/// Start a span for a bulk run.
///
/// The `bulk.status` field is declared empty and is filled in when the last
/// worker finishes.
pub fn start_bulk_span(id: &BulkId, worker_nr: usize) -> Span {
    tracing::info_span!(
        "bulk.run",
        "bulk.id" = %id,
        "bulk.workers" = worker_nr,
        "bulk.status" = tracing::field::Empty,
    )
}

/// Start a worker span as a child of `parent`.
pub fn start_worker_span(parent: &Span, worker: WorkerId) -> Span {
    tracing::info_span!(
        parent: parent,
        "bulk.worker",
        "worker.id" = %worker,
        "worker.tx_nr" = tracing::field::Empty,
    )
}

/// Record a worker state transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::trace!(from = from, to = to, "state_transition");
    });
}

/// Record the final status of a bulk run on its span.
pub fn record_bulk_status(span: &Span, status: &str) {
    span.record("bulk.status", status);
}
