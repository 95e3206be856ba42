//! Reconcile span helpers.
//!
//! Each reconcile call runs inside one `reconcile` span; the outcome is
//! recorded on it once the reconciler returns.

use tracing::Span;

use crate::model::ObjectIdentity;

/// Start a span for one reconcile of `id`.
///
/// `reconcile.result` and `reconcile.attempt` are declared empty and filled
/// by [`record_outcome`].
pub fn start_reconcile_span(id: &ObjectIdentity) -> Span {
    tracing::info_span!(
        "reconcile",
        "object.kind" = %id.kind,
        "object.namespace" = %id.namespace,
        "object.name" = %id.name,
        "reconcile.attempt" = tracing::field::Empty,
        "reconcile.result" = tracing::field::Empty,
    )
}

/// Record the outcome of a reconcile on its span.
pub fn record_outcome(span: &Span, result: &str, attempt: u32) {
    span.record("reconcile.result", result);
    span.record("reconcile.attempt", attempt);
    span.in_scope(|| {
        tracing::debug!(result, attempt, "reconcile finished");
    });
}
