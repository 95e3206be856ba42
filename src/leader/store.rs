//! Lease persistence with compare-and-swap updates.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::model::LeaseRecord;

#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>>;

    /// Insert a new lease. `Error::Conflict` if one already exists.
    /// Returns the stored record with its assigned version.
    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord>;

    /// Replace the lease if its stored version still equals `record.version`.
    /// `Error::Conflict` on a version mismatch, `Error::NotFound` if absent.
    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord>;
}

/// Process-local lease store for tests and single-instance runs.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, LeaseRecord>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, name: &str) -> Option<LeaseRecord> {
        self.leases.lock().get(name).cloned()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>> {
        Ok(self.snapshot(name))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        let mut leases = self.leases.lock();
        if leases.contains_key(&record.name) {
            return Err(Error::Conflict(format!("lease {} already exists", record.name)));
        }
        let mut stored = record.clone();
        stored.version = 1;
        leases.insert(stored.name.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        let mut leases = self.leases.lock();
        let current = leases
            .get_mut(&record.name)
            .ok_or_else(|| Error::NotFound(format!("lease {}", record.name)))?;
        if current.version != record.version {
            return Err(Error::Conflict(format!(
                "lease {}: version {} is stale (now {})",
                record.name, record.version, current.version
            )));
        }
        let mut stored = record.clone();
        stored.version = current.version + 1;
        *current = stored.clone();
        Ok(stored)
    }
}
