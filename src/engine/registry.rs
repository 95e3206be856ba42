//! Reconciler trait, kind → reconciler routing, and the context handed to
//! every reconcile call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{ObjectIdentity, ObjectSnapshot, ReconcileResult};
use crate::store::StateStore;
use crate::watch::ObjectCache;

/// Drives one kind of object toward its desired state.
///
/// Implementations must be idempotent: reconciling an object already in its
/// desired state returns [`ReconcileResult::Done`] without writing.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// The object kind this reconciler handles.
    fn kind(&self) -> &str;

    async fn reconcile(&self, snapshot: ObjectSnapshot, ctx: &ReconcileContext) -> ReconcileResult;
}

/// Maps object kinds to their reconcilers.
#[derive(Default, Clone)]
pub struct ReconcilerRegistry {
    reconcilers: HashMap<String, Arc<dyn Reconciler>>,
}

impl ReconcilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reconciler under its kind. A second registration for the
    /// same kind is rejected.
    pub fn register(&mut self, reconciler: Arc<dyn Reconciler>) -> Result<()> {
        let kind = reconciler.kind().to_string();
        if self.reconcilers.contains_key(&kind) {
            return Err(Error::Config(format!("reconciler for kind {kind} already registered")));
        }
        self.reconcilers.insert(kind, reconciler);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn Reconciler>> {
        self.reconcilers.get(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.reconcilers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.reconcilers.is_empty()
    }
}

/// Store access for reconcilers.
///
/// Writes go straight to the store. A successful write refreshes the cache;
/// a conflict evicts the cached entry so the retry reads the latest version.
#[derive(Clone)]
pub struct ReconcileContext {
    store: Arc<dyn StateStore>,
    cache: Arc<ObjectCache>,
}

impl ReconcileContext {
    pub fn new(store: Arc<dyn StateStore>, cache: Arc<ObjectCache>) -> Self {
        Self { store, cache }
    }

    /// Read from the cache, falling back to the store on a miss.
    ///
    /// The fallback read is not cached: cache membership follows the watch,
    /// and a read racing a delete would otherwise resurrect the entry.
    pub async fn get(&self, id: &ObjectIdentity) -> Result<ObjectSnapshot> {
        if let Some(snapshot) = self.cache.get(id) {
            return Ok(snapshot);
        }
        self.store.get(id).await
    }

    /// Write `snapshot` if its resource version is still current. Returns the
    /// new version.
    pub async fn update(&self, snapshot: &ObjectSnapshot) -> Result<u64> {
        match self.store.update(snapshot).await {
            Ok(version) => {
                let mut written = snapshot.clone();
                written.resource_version = version;
                self.cache.upsert(written);
                Ok(version)
            }
            Err(e) => {
                if e.is_conflict() || e.is_not_found() {
                    debug!(object = %snapshot.id, error = %e, "evicting stale cache entry");
                    self.cache.invalidate(&snapshot.id);
                }
                Err(e)
            }
        }
    }
}
