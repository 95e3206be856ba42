//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or invalid.
//! The database URL is wrapped in secrecy::SecretString to prevent log leaks.

use secrecy::SecretString;

use crate::error::{Error, Result};
use crate::model::{Taint, TaintEffect};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Leader election identity.
    pub identity: String,
    pub owner_label_key: String,
    pub owner_label_value: String,
    pub gpu_node_label_key: String,
    pub gpu_node_label_value: String,
    pub gpu_taint: Taint,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    ///
    /// A variable set to the empty string counts as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let database_url = lookup("DATABASE_URL").ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })?;

        let effect: TaintEffect = var("GPU_TAINT_EFFECT", "NoSchedule").parse()?;
        let gpu_taint = Taint::new(
            var("GPU_TAINT_KEY", "nvidia.com/gpu"),
            var("GPU_TAINT_VALUE", "true"),
            effect,
        );

        let identity = match lookup("POD_NAME") {
            Some(pod) => pod,
            None => {
                let host = lookup("HOSTNAME").unwrap_or_else(|| "addon-controller".to_string());
                format!("{host}_{}", uuid::Uuid::new_v4())
            }
        };

        Ok(Self {
            database_url: SecretString::from(database_url),
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL", "info"),
            identity,
            owner_label_key: var("OWNER_LABEL_KEY", "owner"),
            owner_label_value: var("OWNER_LABEL_VALUE", "platform"),
            gpu_node_label_key: var("GPU_NODE_LABEL_KEY", "gpu"),
            gpu_node_label_value: var("GPU_NODE_LABEL_VALUE", "true"),
            gpu_taint,
        })
    }
}
