//! Configuration types for the warehouse.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{WarehouseError, WarehouseResult};

// ============================================================================
// Default configuration constants
// ============================================================================

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "warehouse.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "WAREHOUSE_";

/// Default maximum PostgreSQL connections.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default connection acquire timeout in seconds.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Default maximum entries per identity cache.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 100_000;

/// Warehouse configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// Durable store configuration.
    pub store: StoreConfig,
    /// Identity cache configuration.
    pub cache: CacheConfig,
    /// Attribute promotion policy configuration.
    pub policy: PolicyConfig,
}

impl WarehouseConfig {
    /// Load configuration from files and environment.
    ///
    /// Configuration is loaded in order (later sources override earlier):
    /// 1. Default values
    /// 2. `warehouse.toml` in current directory
    /// 3. Environment variables prefixed with `WAREHOUSE_`, nested with `__`
    ///    (e.g. `WAREHOUSE_CACHE__MAX_ENTRIES`)
    pub fn load() -> WarehouseResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &str) -> WarehouseResult<Self> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| WarehouseError::Config(e.to_string()))
    }
}

/// Durable store backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-memory store (for testing and local development).
    Memory,
    /// PostgreSQL.
    Postgres {
        /// Connection URL.
        url: String,
        /// Maximum pooled connections.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Seconds to wait for a pooled connection.
        #[serde(default = "default_acquire_timeout_secs")]
        acquire_timeout_secs: u64,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}

const fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

const fn default_acquire_timeout_secs() -> u64 {
    DEFAULT_ACQUIRE_TIMEOUT_SECS
}

/// Identity cache configuration.
///
/// Caches are a performance optimisation only; disabling them is always
/// correct.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable process-local identity caches.
    pub enabled: bool,
    /// Entries per cache before it is cleared.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

/// Promotion policy configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Optional override document (TOML, or JSON if the extension is `.json`).
    ///
    /// If set and unreadable or invalid, the warehouse refuses to start.
    pub override_path: Option<PathBuf>,
}
