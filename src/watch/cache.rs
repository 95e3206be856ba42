//! Read-mostly cache of last-seen object snapshots.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::model::{ObjectIdentity, ObjectSnapshot};

#[derive(Default)]
pub struct ObjectCache {
    objects: RwLock<HashMap<ObjectIdentity, ObjectSnapshot>>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ObjectIdentity) -> Option<ObjectSnapshot> {
        self.objects.read().get(id).cloned()
    }

    /// Store `snapshot` unless the cache already holds a newer version.
    /// Returns whether the entry changed.
    pub fn upsert(&self, snapshot: ObjectSnapshot) -> bool {
        let mut objects = self.objects.write();
        match objects.get(&snapshot.id) {
            Some(cached) if cached.resource_version > snapshot.resource_version => false,
            Some(cached) if *cached == snapshot => false,
            _ => {
                objects.insert(snapshot.id.clone(), snapshot);
                true
            }
        }
    }

    pub fn remove(&self, id: &ObjectIdentity) -> Option<ObjectSnapshot> {
        self.objects.write().remove(id)
    }

    /// Drop the entry so the next read goes to the store.
    pub fn invalidate(&self, id: &ObjectIdentity) {
        self.remove(id);
    }

    /// Replace every entry of `kind` with `snapshots`, as after a re-list.
    pub fn replace_kind(&self, kind: &str, snapshots: Vec<ObjectSnapshot>) {
        let mut objects = self.objects.write();
        objects.retain(|id, _| id.kind != kind);
        for snapshot in snapshots {
            objects.insert(snapshot.id.clone(), snapshot);
        }
    }

    pub fn ids_of(&self, kind: &str) -> Vec<ObjectIdentity> {
        let mut ids: Vec<ObjectIdentity> = self
            .objects
            .read()
            .keys()
            .filter(|id| id.kind == kind)
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
