//! Object rows: optimistic-concurrency updates and LISTEN/NOTIFY watches.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt as _;
use serde::Deserialize;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{ObjectIdentity, ObjectSnapshot, WatchEvent, WatchEventType};
use crate::store::{StateStore, WatchStream};

use super::{Db, from_db_version, to_db_version};

const CHANGE_CHANNEL: &str = "object_events";

type ObjectRow = (String, String, String, i64, serde_json::Value, serde_json::Value);

const SELECT_COLUMNS: &str = "SELECT kind, namespace, name, resource_version, labels, spec FROM objects";

fn snapshot_from_row(row: ObjectRow) -> Result<ObjectSnapshot> {
    let (kind, namespace, name, version, labels, spec) = row;
    let labels: BTreeMap<String, String> = serde_json::from_value(labels)?;
    Ok(ObjectSnapshot {
        id: ObjectIdentity::new(kind, namespace, name),
        resource_version: from_db_version(version)?,
        labels,
        spec,
    })
}

async fn fetch_object(pool: &PgPool, id: &ObjectIdentity) -> Result<ObjectSnapshot> {
    let row: Option<ObjectRow> = sqlx::query_as(&format!(
        "{SELECT_COLUMNS} WHERE kind = $1 AND namespace = $2 AND name = $3"
    ))
    .bind(&id.kind)
    .bind(&id.namespace)
    .bind(&id.name)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => snapshot_from_row(row),
        None => Err(Error::NotFound(id.to_string())),
    }
}

/// NOTIFY payload written by the `objects_notify` trigger.
#[derive(Debug, Deserialize)]
struct ChangeNotice {
    op: String,
    kind: String,
    namespace: String,
    name: String,
    resource_version: i64,
}

impl Db {
    pub async fn get_object(&self, id: &ObjectIdentity) -> Result<ObjectSnapshot> {
        fetch_object(self.pool(), id).await
    }

    /// All objects, optionally of one kind, ordered by identity.
    pub async fn list_objects(&self, kind: Option<&str>) -> Result<Vec<ObjectSnapshot>> {
        let rows: Vec<ObjectRow> = match kind {
            Some(kind) => {
                sqlx::query_as(&format!(
                    "{SELECT_COLUMNS} WHERE kind = $1 ORDER BY kind, namespace, name"
                ))
                .bind(kind)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY kind, namespace, name"))
                    .fetch_all(self.pool())
                    .await?
            }
        };
        rows.into_iter().map(snapshot_from_row).collect()
    }

    /// Create or overwrite an object regardless of its current version.
    pub async fn apply_object(
        &self,
        id: &ObjectIdentity,
        labels: &BTreeMap<String, String>,
        spec: &serde_json::Value,
    ) -> Result<ObjectSnapshot> {
        let row: ObjectRow = sqlx::query_as(
            "INSERT INTO objects (kind, namespace, name, labels, spec)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (kind, namespace, name) DO UPDATE
             SET labels = EXCLUDED.labels,
                 spec = EXCLUDED.spec,
                 resource_version = nextval('object_versions'),
                 updated_at = now()
             RETURNING kind, namespace, name, resource_version, labels, spec",
        )
        .bind(&id.kind)
        .bind(&id.namespace)
        .bind(&id.name)
        .bind(serde_json::to_value(labels)?)
        .bind(spec)
        .fetch_one(self.pool())
        .await?;
        snapshot_from_row(row)
    }

    pub async fn delete_object(&self, id: &ObjectIdentity) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM objects WHERE kind = $1 AND namespace = $2 AND name = $3")
                .bind(&id.kind)
                .bind(&id.namespace)
                .bind(&id.name)
                .execute(self.pool())
                .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Write `snapshot` if the stored version still equals its
    /// `resource_version`. Returns the new version.
    pub async fn update_object(&self, snapshot: &ObjectSnapshot) -> Result<u64> {
        let id = &snapshot.id;
        let updated: Option<(i64,)> = sqlx::query_as(
            "UPDATE objects
             SET labels = $4, spec = $5,
                 resource_version = nextval('object_versions'),
                 updated_at = now()
             WHERE kind = $1 AND namespace = $2 AND name = $3 AND resource_version = $6
             RETURNING resource_version",
        )
        .bind(&id.kind)
        .bind(&id.namespace)
        .bind(&id.name)
        .bind(serde_json::to_value(&snapshot.labels)?)
        .bind(&snapshot.spec)
        .bind(to_db_version(snapshot.resource_version)?)
        .fetch_optional(self.pool())
        .await?;

        if let Some((version,)) = updated {
            return from_db_version(version);
        }

        // Nothing matched: either the object is gone or someone wrote first.
        let current = fetch_object(self.pool(), id).await?;
        Err(Error::Conflict(format!(
            "{id}: version {} is stale (now {})",
            snapshot.resource_version, current.resource_version
        )))
    }

    /// Change stream for `kind`. Ends when the listener connection drops,
    /// since notifications sent while disconnected are lost.
    pub async fn watch_objects(&self, kind: &str) -> Result<WatchStream> {
        let mut listener = PgListener::connect_with(self.pool()).await?;
        listener.listen(CHANGE_CHANNEL).await?;

        let state = ListenState {
            listener,
            pool: self.pool().clone(),
            kind: kind.to_string(),
            failed: false,
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }
            loop {
                let received = state.listener.try_recv().await;
                match received {
                    Ok(Some(notification)) => {
                        let decoded = state.decode(notification.payload()).await;
                        match decoded {
                            Ok(Some(event)) => return Some((Ok(event), state)),
                            Ok(None) => continue,
                            Err(e) => return Some((Err(e), state)),
                        }
                    }
                    Ok(None) => {
                        debug!(kind = %state.kind, "listener connection lost");
                        return None;
                    }
                    Err(e) => {
                        state.failed = true;
                        return Some((Err(Error::from(e)), state));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

struct ListenState {
    listener: PgListener,
    pool: PgPool,
    kind: String,
    failed: bool,
}

impl ListenState {
    /// Turn a notice into an event for this kind, reading the current row
    /// for inserts and updates.
    async fn decode(&self, payload: &str) -> Result<Option<WatchEvent>> {
        let notice: ChangeNotice = serde_json::from_str(payload)?;
        if notice.kind != self.kind {
            return Ok(None);
        }
        let id = ObjectIdentity::new(notice.kind, notice.namespace, notice.name);

        if notice.op == "DELETE" {
            let mut snapshot = ObjectSnapshot::new(id);
            snapshot.resource_version = from_db_version(notice.resource_version)?;
            return Ok(Some(WatchEvent::new(WatchEventType::Deleted, snapshot)));
        }

        let event_type = if notice.op == "INSERT" {
            WatchEventType::Added
        } else {
            WatchEventType::Modified
        };
        match fetch_object(&self.pool, &id).await {
            Ok(snapshot) => Ok(Some(WatchEvent::new(event_type, snapshot))),
            // Deleted again before we read it; the DELETE notice follows.
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StateStore for Db {
    async fn get(&self, id: &ObjectIdentity) -> Result<ObjectSnapshot> {
        self.get_object(id).await
    }

    async fn update(&self, snapshot: &ObjectSnapshot) -> Result<u64> {
        self.update_object(snapshot).await
    }

    async fn list(&self, kind: &str) -> Result<Vec<ObjectSnapshot>> {
        self.list_objects(Some(kind)).await
    }

    async fn watch(&self, kind: &str) -> Result<WatchStream> {
        self.watch_objects(kind).await
    }
}
