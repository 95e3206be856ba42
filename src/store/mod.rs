//! State store contract consumed by the engine.
//!
//! Any backend with get / list / watch / update-with-version-check semantics
//! can drive the controller. [`memory::InMemoryStore`] backs tests and local
//! runs; [`crate::db::Db`] is the Postgres implementation.

pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::model::{ObjectIdentity, ObjectSnapshot, WatchEvent};

pub use memory::InMemoryStore;

/// Change stream for one kind. Ends or yields an error when the subscription
/// breaks; the caller re-lists and re-subscribes.
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current state of one object. `Error::NotFound` if it does not exist.
    async fn get(&self, id: &ObjectIdentity) -> Result<ObjectSnapshot>;

    /// Write `snapshot` if the stored version still equals
    /// `snapshot.resource_version`. Returns the new version, or
    /// `Error::Conflict` when another writer got there first.
    async fn update(&self, snapshot: &ObjectSnapshot) -> Result<u64>;

    /// Every object of a kind, for initial sync and resync.
    async fn list(&self, kind: &str) -> Result<Vec<ObjectSnapshot>>;

    /// Subscribe to changes of a kind.
    async fn watch(&self, kind: &str) -> Result<WatchStream>;
}
