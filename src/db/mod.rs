//! Database connection pool, migrations, and health check.
//!
//! [`Db`] is the production [`StateStore`](crate::store::StateStore) and
//! [`LeaseStore`](crate::leader::LeaseStore): objects and leases live in
//! Postgres, change streams come from LISTEN/NOTIFY.

pub mod lease;
pub mod objects;

use crate::error::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn to_db_version(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| Error::Other(format!("version {version} out of range")))
}

pub(crate) fn from_db_version(version: i64) -> Result<u64> {
    u64::try_from(version).map_err(|_| Error::Other(format!("negative version {version}")))
}
