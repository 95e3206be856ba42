//! Core data model.
//!
//! An object is anything the controller reconciles (a namespace, a node).
//! It has identity (kind + namespace + name), a resource version used for
//! optimistic concurrency, labels, and an opaque spec.

pub mod lease;
pub mod taint;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use lease::LeaseRecord;
pub use taint::{Taint, TaintEffect};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Uniquely identifies one reconcilable object. Also the work queue's dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub kind: String,
    /// Empty for cluster-scoped kinds.
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identity of a cluster-scoped object.
    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, "", name)
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl std::fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Observed state of an object at fetch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub id: ObjectIdentity,

    /// Fingerprint checked on update. Strictly increases on every write.
    pub resource_version: u64,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Kind-specific body. The engine never interprets it.
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl ObjectSnapshot {
    pub fn new(id: ObjectIdentity) -> Self {
        Self {
            id,
            resource_version: 0,
            labels: BTreeMap::new(),
            spec: serde_json::Value::Null,
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }

    pub fn label_value(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Reconcile result
// ---------------------------------------------------------------------------

/// What a reconcile function asks the engine to do with the identity next.
#[derive(Debug)]
pub enum ReconcileResult {
    /// Converged. The attempt counter is reset.
    Done,
    /// Converged for now; look again after the delay.
    RequeueAfter(Duration),
    /// Look again as soon as a worker is free.
    RequeueImmediate,
    /// Failed; retried with backoff.
    Error(Error),
}

impl ReconcileResult {
    pub fn is_error(&self) -> bool {
        matches!(self, ReconcileResult::Error(_))
    }

    /// Label used in metrics and spans.
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileResult::Done => "done",
            ReconcileResult::RequeueAfter(_) => "requeue_after",
            ReconcileResult::RequeueImmediate => "requeue",
            ReconcileResult::Error(_) => "error",
        }
    }
}

impl From<crate::error::Result<ReconcileResult>> for ReconcileResult {
    fn from(result: crate::error::Result<ReconcileResult>) -> Self {
        result.unwrap_or_else(ReconcileResult::Error)
    }
}

// ---------------------------------------------------------------------------
// Watch events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl std::fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WatchEventType::Added => "added",
            WatchEventType::Modified => "modified",
            WatchEventType::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

/// One change notification from the store. For `Deleted` the snapshot is the
/// last known state.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub snapshot: ObjectSnapshot,
}

impl WatchEvent {
    pub fn new(event_type: WatchEventType, snapshot: ObjectSnapshot) -> Self {
        Self {
            event_type,
            snapshot,
        }
    }

    pub fn id(&self) -> &ObjectIdentity {
        &self.snapshot.id
    }
}
