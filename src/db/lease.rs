//! Leader leases in Postgres, compare-and-swap on `version`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::leader::LeaseStore;
use crate::model::LeaseRecord;

use super::{Db, from_db_version, to_db_version};

type LeaseRow = (String, String, DateTime<Utc>, DateTime<Utc>, i32, i64);

fn lease_from_row(row: LeaseRow) -> Result<LeaseRecord> {
    let (name, holder_identity, acquire_time, renew_deadline, transitions, version) = row;
    Ok(LeaseRecord {
        name,
        holder_identity,
        acquire_time,
        renew_deadline,
        lease_transitions: u32::try_from(transitions)
            .map_err(|_| Error::Other(format!("negative lease transitions {transitions}")))?,
        version: from_db_version(version)?,
    })
}

fn db_transitions(record: &LeaseRecord) -> Result<i32> {
    i32::try_from(record.lease_transitions)
        .map_err(|_| Error::Other(format!("lease transitions {} out of range", record.lease_transitions)))
}

#[async_trait]
impl LeaseStore for Db {
    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>> {
        let row: Option<LeaseRow> = sqlx::query_as(
            "SELECT name, holder_identity, acquire_time, renew_deadline, lease_transitions, version
             FROM leases WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        row.map(lease_from_row).transpose()
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        let row: Option<LeaseRow> = sqlx::query_as(
            "INSERT INTO leases (name, holder_identity, acquire_time, renew_deadline, lease_transitions, version)
             VALUES ($1, $2, $3, $4, $5, 1)
             ON CONFLICT (name) DO NOTHING
             RETURNING name, holder_identity, acquire_time, renew_deadline, lease_transitions, version",
        )
        .bind(&record.name)
        .bind(&record.holder_identity)
        .bind(record.acquire_time)
        .bind(record.renew_deadline)
        .bind(db_transitions(record)?)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => lease_from_row(row),
            None => Err(Error::Conflict(format!("lease {} already exists", record.name))),
        }
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        let row: Option<LeaseRow> = sqlx::query_as(
            "UPDATE leases
             SET holder_identity = $2, acquire_time = $3, renew_deadline = $4,
                 lease_transitions = $5, version = version + 1
             WHERE name = $1 AND version = $6
             RETURNING name, holder_identity, acquire_time, renew_deadline, lease_transitions, version",
        )
        .bind(&record.name)
        .bind(&record.holder_identity)
        .bind(record.acquire_time)
        .bind(record.renew_deadline)
        .bind(db_transitions(record)?)
        .bind(to_db_version(record.version)?)
        .fetch_optional(self.pool())
        .await?;

        if let Some(row) = row {
            return lease_from_row(row);
        }
        match LeaseStore::get(self, &record.name).await? {
            Some(current) => Err(Error::Conflict(format!(
                "lease {}: version {} is stale (now {})",
                record.name, record.version, current.version
            ))),
            None => Err(Error::NotFound(format!("lease {}", record.name))),
        }
    }
}
