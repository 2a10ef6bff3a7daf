//! Server configuration read from the environment.

use std::time::Duration;
use thiserror::Error;

use crate::auth::VerifierConfig;
use crate::db::DEFAULT_BATCH_SIZE;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("Either AUTH_JWKS_URL or AUTH_JWT_SECRET must be set")]
    MissingVerifier,
}

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port
    pub port: u16,
    /// Token verification settings
    pub verifier: VerifierConfig,
    /// REST base of the relational store; `None` selects the in-memory store
    pub store_url: Option<String>,
    /// Service credential sent to the store
    pub store_service_key: String,
    /// Operator token for the admin endpoints
    pub admin_token: Option<String>,
    /// Sled path for document snapshots
    pub storage_path: String,
    /// How often dirty documents are flushed and projected
    pub projection_interval: Duration,
    /// Rows per store write request
    pub batch_size: usize,
    /// Timeout for store and key set requests
    pub store_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            verifier: VerifierConfig::default(),
            store_url: None,
            store_service_key: String::new(),
            admin_token: None,
            storage_path: "./data/graph-collab.sled".to_string(),
            projection_interval: Duration::from_millis(1000),
            batch_size: DEFAULT_BATCH_SIZE,
            store_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let verifier = VerifierConfig {
            jwks_url: get("AUTH_JWKS_URL"),
            shared_secret: get("AUTH_JWT_SECRET"),
            issuer: get("AUTH_ISSUER"),
            audience: get("AUTH_AUDIENCE").unwrap_or(defaults.verifier.audience),
        };
        if verifier.jwks_url.is_none() && verifier.shared_secret.is_none() {
            return Err(ConfigError::MissingVerifier);
        }

        let batch_size = parse_or(&get, "STORE_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "STORE_BATCH_SIZE",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            port: parse_or(&get, "PORT", defaults.port)?,
            verifier,
            store_url: get("STORE_URL"),
            store_service_key: get("STORE_SERVICE_KEY").unwrap_or_default(),
            admin_token: get("ADMIN_TOKEN"),
            storage_path: get("STORAGE_PATH").unwrap_or(defaults.storage_path),
            projection_interval: Duration::from_millis(parse_or(&get, "PROJECTION_INTERVAL_MS", 1000)?),
            batch_size,
            store_timeout: Duration::from_secs(parse_or(&get, "STORE_TIMEOUT_SECS", 10)?),
        })
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}
