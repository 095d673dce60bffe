//! # Sync Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TILL_STORE_ID=store-001                                            │
//! │     TILL_SERVER_URL=https://api.example.com                            │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/till/sync.toml (Linux)                                   │
//! │     ~/Library/Application Support/com.till.till/sync.toml (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Register 1"
//!
//! [store]
//! id = "store-001"
//! extra = ["store-002"]
//!
//! [server]
//! base_url = "https://api.example.com"
//! changes_path = "/sync/changes"
//! request_timeout_secs = 15
//!
//! [sync]
//! poll_interval_secs = 30
//! initial_backoff_ms = 1000
//! max_backoff_secs = 300
//!
//! [cache]
//! catalog_ttl_secs = 3600
//! stock_ttl_secs = 300
//! standard_ttl_secs = 900
//!
//! [database]
//! path = "/var/lib/till/till.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use till_core::CachePolicy;
use till_db::DbConfig;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Register 1").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "POS Terminal".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Store Configuration
// =============================================================================

/// Store contexts this terminal syncs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Default store context.
    pub id: String,

    /// Further store contexts, each with its own queue and checkpoint.
    #[serde(default)]
    pub extra: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            id: "default-store".to_string(),
            extra: Vec::new(),
        }
    }
}

// =============================================================================
// Server Settings
// =============================================================================

/// Where the authoritative server lives and how to talk to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Base URL; replay paths and the changes path are joined onto it.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path of the changes-since endpoint.
    #[serde(default = "default_changes_path")]
    pub changes_path: String,

    /// Per-request timeout (seconds). A timeout counts as offline.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Header carrying the idempotency token.
    #[serde(default = "default_idempotency_header")]
    pub idempotency_header: String,

    /// Header carrying the store scope.
    #[serde(default = "default_store_header")]
    pub store_header: String,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_changes_path() -> String {
    "/sync/changes".to_string()
}
fn default_request_timeout() -> u64 {
    15
}
fn default_idempotency_header() -> String {
    "Idempotency-Key".to_string()
}
fn default_store_header() -> String {
    "X-Store-Id".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            base_url: default_base_url(),
            changes_path: default_changes_path(),
            request_timeout_secs: default_request_timeout(),
            idempotency_header: default_idempotency_header(),
            store_header: default_store_header(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Pass scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Interval between background passes (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Initial backoff (milliseconds) after an aborted background pass.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Done log entries older than this are deleted (days).
    #[serde(default = "default_cleanup_days")]
    pub cleanup_after_days: u32,
}

fn default_poll_interval() -> u64 {
    30
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    300
}
fn default_cleanup_days() -> u32 {
    7
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            poll_interval_secs: default_poll_interval(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            cleanup_after_days: default_cleanup_days(),
        }
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

/// TTL per cache class (seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_catalog_ttl")]
    pub catalog_ttl_secs: u64,
    #[serde(default = "default_stock_ttl")]
    pub stock_ttl_secs: u64,
    #[serde(default = "default_standard_ttl")]
    pub standard_ttl_secs: u64,
}

fn default_catalog_ttl() -> u64 {
    3600
}
fn default_stock_ttl() -> u64 {
    300
}
fn default_standard_ttl() -> u64 {
    900
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            catalog_ttl_secs: default_catalog_ttl(),
            stock_ttl_secs: default_stock_ttl(),
            standard_ttl_secs: default_standard_ttl(),
        }
    }
}

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub max_connections: Option<u32>,
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::InvalidConfig("device.id must not be empty".into()));
        }

        if self.store_ids().iter().any(|s| s.trim().is_empty()) {
            return Err(SyncError::InvalidConfig("store ids must not be empty".into()));
        }

        let url = self.base_url()?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SyncError::InvalidUrl(format!(
                "Server URL must start with http:// or https://, got: {}",
                self.server.base_url
            )));
        }

        if self.server.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.sync.poll_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }

        let ttls = [
            self.cache.catalog_ttl_secs,
            self.cache.stock_ttl_secs,
            self.cache.standard_ttl_secs,
        ];
        if ttls.contains(&0) {
            return Err(SyncError::InvalidConfig("cache TTLs must be greater than 0".into()));
        }

        Ok(())
    }

    /// Applies `TILL_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("TILL_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(name) = lookup("TILL_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(id) = lookup("TILL_STORE_ID") {
            self.store.id = id;
        }

        if let Some(extra) = lookup("TILL_EXTRA_STORES") {
            self.store.extra = extra
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(url) = lookup("TILL_SERVER_URL") {
            debug!(url = %url, "Overriding server URL from environment");
            self.server.base_url = url;
        }

        if let Some(path) = lookup("TILL_CHANGES_PATH") {
            self.server.changes_path = path;
        }

        if let Some(secs) = lookup("TILL_REQUEST_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.server.request_timeout_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid TILL_REQUEST_TIMEOUT_SECS"),
            }
        }

        if let Some(secs) = lookup("TILL_POLL_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.sync.poll_interval_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid TILL_POLL_INTERVAL_SECS"),
            }
        }

        if let Some(path) = lookup("TILL_DATABASE_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "till", "till")
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Every configured store, default first, without duplicates.
    pub fn store_ids(&self) -> Vec<String> {
        let mut ids = vec![self.store.id.clone()];
        for id in &self.store.extra {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    pub fn base_url(&self) -> SyncResult<Url> {
        Ok(Url::parse(&self.server.base_url)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync.poll_interval_secs)
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            catalog_ttl: secs(self.cache.catalog_ttl_secs),
            stock_ttl: secs(self.cache.stock_ttl_secs),
            standard_ttl: secs(self.cache.standard_ttl_secs),
        }
    }

    /// Database file: configured path, else the platform data directory.
    pub fn database_path(&self) -> PathBuf {
        self.database.path.clone().unwrap_or_else(|| {
            Self::project_dirs()
                .map(|dirs| dirs.data_dir().join("till.db"))
                .unwrap_or_else(|| PathBuf::from("till.db"))
        })
    }

    pub fn db_config(&self) -> DbConfig {
        let config = DbConfig::new(self.database_path());
        match self.database.max_connections {
            Some(max) => config.max_connections(max),
            None => config,
        }
    }
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}
