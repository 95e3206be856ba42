//! Leader lease record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cluster-wide lease, one per engine logical name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub name: String,

    /// Current holder. Empty after a voluntary release.
    pub holder_identity: String,

    /// When the current holder took the lease.
    pub acquire_time: DateTime<Utc>,

    /// The lease may be taken by another identity once this instant passes
    /// without a renewal.
    pub renew_deadline: DateTime<Utc>,

    /// Number of holder changes.
    pub lease_transitions: u32,

    /// Store version for compare-and-swap. Assigned by the lease store.
    pub version: u64,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.renew_deadline <= now
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        !self.holder_identity.is_empty() && self.holder_identity == identity
    }
}
