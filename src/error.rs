//! Error types for addon-controller.
//!
//! The variants double as the engine's retry taxonomy: `NotFound` is terminal
//! and silent, `Conflict` and the transient family are retried with backoff,
//! `Permanent` is retried too but reported as a persistent failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("version conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors a later attempt may not hit again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_) | Error::Transient(_) | Error::Database(_) | Error::Io(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Database(sqlx::Error::RowNotFound) => true,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Permanent(_))
    }

    /// Short label used for metrics and log fields.
    pub fn class(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Transient(_) | Error::Database(_) | Error::Io(_) => "transient",
            Error::Permanent(_) => "permanent",
            Error::Migrate(_) | Error::Config(_) => "config",
            Error::Serialization(_) | Error::Other(_) => "other",
        }
    }
}
