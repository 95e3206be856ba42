//! In-process state store.
//!
//! Versions come from one store-wide counter, like a cluster-wide revision.
//! Watches are fanned out through a broadcast channel; a subscriber that
//! falls behind gets a `Transient` error and is expected to re-list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use super::{StateStore, WatchStream};
use crate::error::{Error, Result};
use crate::model::{ObjectIdentity, ObjectSnapshot, WatchEvent, WatchEventType};

const EVENT_BUFFER: usize = 1024;

pub struct InMemoryStore {
    objects: RwLock<HashMap<ObjectIdentity, ObjectSnapshot>>,
    revision: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            objects: RwLock::new(HashMap::new()),
            revision: AtomicU64::new(0),
            events,
        }
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Create a new object. `Error::Conflict` if it already exists.
    pub fn create(&self, mut snapshot: ObjectSnapshot) -> Result<ObjectSnapshot> {
        let mut objects = self.objects.write();
        if objects.contains_key(&snapshot.id) {
            return Err(Error::Conflict(format!("{} already exists", snapshot.id)));
        }
        snapshot.resource_version = self.next_revision();
        objects.insert(snapshot.id.clone(), snapshot.clone());
        let _ = self
            .events
            .send(WatchEvent::new(WatchEventType::Added, snapshot.clone()));
        Ok(snapshot)
    }

    /// Unconditional write, as an external actor that does not care about
    /// versions would do it. Creates the object if missing.
    pub fn apply(&self, mut snapshot: ObjectSnapshot) -> ObjectSnapshot {
        let mut objects = self.objects.write();
        snapshot.resource_version = self.next_revision();
        let event_type = if objects.contains_key(&snapshot.id) {
            WatchEventType::Modified
        } else {
            WatchEventType::Added
        };
        objects.insert(snapshot.id.clone(), snapshot.clone());
        let _ = self.events.send(WatchEvent::new(event_type, snapshot.clone()));
        snapshot
    }

    pub fn delete(&self, id: &ObjectIdentity) -> Result<ObjectSnapshot> {
        let mut objects = self.objects.write();
        let removed = objects
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let _ = self
            .events
            .send(WatchEvent::new(WatchEventType::Deleted, removed.clone()));
        Ok(removed)
    }

    /// Synchronous peek, handy for assertions.
    pub fn snapshot(&self, id: &ObjectIdentity) -> Option<ObjectSnapshot> {
        self.objects.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get(&self, id: &ObjectIdentity) -> Result<ObjectSnapshot> {
        self.snapshot(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn update(&self, snapshot: &ObjectSnapshot) -> Result<u64> {
        let mut objects = self.objects.write();
        let current = objects
            .get(&snapshot.id)
            .ok_or_else(|| Error::NotFound(snapshot.id.to_string()))?;
        if current.resource_version != snapshot.resource_version {
            return Err(Error::Conflict(format!(
                "{}: have version {}, stored {}",
                snapshot.id, snapshot.resource_version, current.resource_version
            )));
        }

        let mut stored = snapshot.clone();
        stored.resource_version = self.next_revision();
        let version = stored.resource_version;
        objects.insert(stored.id.clone(), stored.clone());
        let _ = self
            .events
            .send(WatchEvent::new(WatchEventType::Modified, stored));
        Ok(version)
    }

    async fn list(&self, kind: &str) -> Result<Vec<ObjectSnapshot>> {
        let mut items: Vec<ObjectSnapshot> = self
            .objects
            .read()
            .values()
            .filter(|s| s.id.kind == kind)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    async fn watch(&self, kind: &str) -> Result<WatchStream> {
        let kind = kind.to_string();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |item| {
            match item {
                Ok(event) if event.snapshot.id.kind == kind => Some(Ok(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(Error::Transient(
                    format!("{kind} watch lagged by {missed} events"),
                ))),
            }
        });
        Ok(Box::pin(stream))
    }
}
