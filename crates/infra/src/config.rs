//! Store configuration loading and representation.
//!
//! Configuration comes from the environment; every key is optional and falls
//! back to a default with a warning. Malformed values are errors rather than
//! silent defaults.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::SqliteConnectOptions;
use thiserror::Error;

pub const DATABASE_URL_ENV: &str = "STOCKFLOW_DATABASE_URL";
pub const MAX_CONNECTIONS_ENV: &str = "STOCKFLOW_DB_MAX_CONNECTIONS";
pub const BUSY_TIMEOUT_MS_ENV: &str = "STOCKFLOW_DB_BUSY_TIMEOUT_MS";
pub const CREATE_IF_MISSING_ENV: &str = "STOCKFLOW_DB_CREATE_IF_MISSING";

const DEFAULT_DATABASE_URL: &str = "sqlite://stockflow.db";
const IN_MEMORY_DATABASE_URL: &str = "sqlite::memory:";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Connection settings for the SQLite inventory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// sqlx SQLite URL, e.g. `sqlite://data/stockflow.db` or `sqlite::memory:`.
    pub database_url: String,
    pub max_connections: u32,
    /// How long a writer waits for a competing transaction before failing.
    pub busy_timeout: Duration,
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            create_if_missing: true,
        }
    }
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    /// A private in-memory database.
    ///
    /// Each SQLite connection to `:memory:` sees its own database, so the pool
    /// is pinned to a single long-lived connection.
    pub fn in_memory() -> Self {
        Self {
            database_url: IN_MEMORY_DATABASE_URL.to_string(),
            max_connections: 1,
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }

    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup (environment, test map, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_url = lookup(DATABASE_URL_ENV).unwrap_or_else(|| {
            tracing::warn!(
                key = DATABASE_URL_ENV,
                default = DEFAULT_DATABASE_URL,
                "database url not set; using default"
            );
            defaults.database_url.clone()
        });

        let max_connections = match lookup(MAX_CONNECTIONS_ENV) {
            Some(raw) => raw.trim().parse::<u32>().map_err(|e| {
                ConfigError::invalid(MAX_CONNECTIONS_ENV, raw.as_str(), e.to_string())
            })?,
            None => defaults.max_connections,
        };

        let busy_timeout = match lookup(BUSY_TIMEOUT_MS_ENV) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| {
                    ConfigError::invalid(BUSY_TIMEOUT_MS_ENV, raw.as_str(), e.to_string())
                })?,
            None => defaults.busy_timeout,
        };

        let create_if_missing = match lookup(CREATE_IF_MISSING_ENV) {
            Some(raw) => parse_bool(CREATE_IF_MISSING_ENV, &raw)?,
            None => defaults.create_if_missing,
        };

        let config = Self {
            database_url,
            max_connections,
            busy_timeout,
            create_if_missing,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::invalid(
                DATABASE_URL_ENV,
                self.database_url.as_str(),
                "database url cannot be empty",
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::invalid(
                MAX_CONNECTIONS_ENV,
                "0",
                "at least one connection is required",
            ));
        }
        if self.is_in_memory() && self.max_connections != 1 {
            return Err(ConfigError::invalid(
                MAX_CONNECTIONS_ENV,
                self.max_connections.to_string(),
                "an in-memory database must use exactly one connection",
            ));
        }
        Ok(())
    }

    pub(crate) fn connect_options(&self) -> Result<SqliteConnectOptions, ConfigError> {
        let options = SqliteConnectOptions::from_str(&self.database_url).map_err(|e| {
            ConfigError::invalid(DATABASE_URL_ENV, self.database_url.as_str(), e.to_string())
        })?;

        Ok(options
            .create_if_missing(self.create_if_missing)
            .busy_timeout(self.busy_timeout))
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, raw, "expected a boolean")),
    }
}
