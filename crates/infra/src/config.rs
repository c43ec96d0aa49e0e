//! Store configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::account_store::PoolSettings;

/// Which `AccountStore` implementation `open_store` builds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// In-memory map flushed to one JSON record per account.
    #[default]
    File,
    /// SQLite or PostgreSQL through a connection pool.
    Relational,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "cached-file" | "json" => Ok(Self::File),
            "relational" | "sql" | "sqlite" | "postgres" => Ok(Self::Relational),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// Record directory for the file backend.
    pub data_dir: PathBuf,
    /// Background sweep period for the file backend.
    pub flush_interval: Duration,
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::File,
            data_dir: PathBuf::from("data/accounts"),
            flush_interval: Duration::from_secs(300),
            database_url: "sqlite://data/coinvault.db?mode=rwc".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    /// Read overrides from the environment, keeping defaults for unset or
    /// unparseable values.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `COINVAULT_BACKEND` | `backend` (`file` / `relational`) |
    /// | `COINVAULT_DATA_DIR` | `data_dir` |
    /// | `COINVAULT_FLUSH_INTERVAL_SECS` | `flush_interval` |
    /// | `DATABASE_URL` | `database_url` |
    /// | `COINVAULT_POOL_MAX` | `max_connections` |
    /// | `COINVAULT_POOL_MIN` | `min_connections` |
    /// | `COINVAULT_ACQUIRE_TIMEOUT_MS` | `acquire_timeout` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backend: env_or("COINVAULT_BACKEND", defaults.backend),
            data_dir: std::env::var("COINVAULT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            flush_interval: Duration::from_secs(env_or(
                "COINVAULT_FLUSH_INTERVAL_SECS",
                defaults.flush_interval.as_secs(),
            )),
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: env_or("COINVAULT_POOL_MAX", defaults.max_connections),
            min_connections: env_or("COINVAULT_POOL_MIN", defaults.min_connections),
            acquire_timeout: Duration::from_millis(env_or(
                "COINVAULT_ACQUIRE_TIMEOUT_MS",
                defaults.acquire_timeout.as_millis() as u64,
            )),
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_pool_size(mut self, min: u32, max: u32) -> Self {
        self.min_connections = min;
        self.max_connections = max.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.max_connections,
            min_connections: self.min_connections.min(self.max_connections),
            acquire_timeout: self.acquire_timeout,
        }
    }
}

/// Parse `key` from the environment, falling back to `default` when unset or invalid.
pub fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|e| {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid configuration value");
            default
        }),
        Err(_) => default,
    }
}
