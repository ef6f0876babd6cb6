//! Configuration for Compass.
//!
//! Compile-time defaults live in the constant structs below. Runtime
//! settings are read into [`CompassConfig`] from a JSON file; every field
//! is optional and falls back to those defaults. Durations are written the
//! way the query language writes them, e.g. `"2m"`, `"720h"` or `"1.5s"`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::asset::types::is_valid_type_name;
use crate::error::{CompassError, Result};

/// Primary store defaults.
pub struct StoreConfig;

impl StoreConfig {
    pub const DEFAULT_DB_PATH: &'static str = "compass.db";
    pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
    /// Page size used when `size` is zero on version history.
    pub const DEFAULT_MAX_RESULT_SIZE: i64 = 100;
}

/// Search index defaults.
pub struct SearchConfigDefaults;

impl SearchConfigDefaults {
    pub const URL: &'static str = "http://localhost:9200";
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    /// Alias every per-service index is attached to.
    pub const READ_ALIAS: &'static str = "universe";
    pub const DEFAULT_RANK_BY: &'static str = "data.stats_metadata.query_count";
    pub const SUGGEST_SIZE: usize = 5;
}

/// Worker defaults.
pub struct WorkerDefaults;

impl WorkerDefaults {
    pub const POOL_SIZE: usize = 3;
    pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const INDEX_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DELETE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const SYNC_TIMEOUT: Duration = Duration::from_secs(15 * 60);
    pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
    pub const BACKOFF_MAX: Duration = Duration::from_secs(60);
    /// Batch size of the sync handler.
    pub const SYNC_BATCH_SIZE: i64 = 1000;
    /// Added to the longest handler timeout to form a job lease.
    pub const LEASE_MARGIN: Duration = Duration::from_secs(30);
}

/// Service defaults.
pub struct ServiceDefaults;

impl ServiceDefaults {
    pub const DELETE_ASSETS_TIMEOUT: Duration = Duration::from_secs(2 * 60);
    pub const IDENTITY_HEADER: &'static str = "Compass-User-Email";
    pub const USER_PROVIDER: &'static str = "unknown";
    pub const CLEANUP_EXPIRY: Duration = Duration::from_secs(720 * 3600);
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompassConfig {
    pub db: DbConfig,
    pub elasticsearch: ElasticsearchConfig,
    pub service: AssetServiceConfig,
    pub worker: WorkerConfig,
    pub identity: IdentityConfig,
    pub server: ServerConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(StoreConfig::DEFAULT_DB_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticsearchConfig {
    pub url: String,
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
    /// Words stripped from the text of a column search before fuzzy matching.
    pub column_search_exclusion_list: Vec<String>,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: SearchConfigDefaults::URL.to_string(),
            request_timeout: SearchConfigDefaults::REQUEST_TIMEOUT,
            column_search_exclusion_list: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetServiceConfig {
    pub additional_types: Vec<String>,
    /// Ceiling of a background bulk delete.
    #[serde(with = "duration_str")]
    pub delete_assets_timeout: Duration,
    /// Paths inside `data` whose arrays merge by an identifier field on patch.
    pub array_merge_rules: BTreeMap<String, String>,
}

impl Default for AssetServiceConfig {
    fn default() -> Self {
        Self {
            additional_types: Vec::new(),
            delete_assets_timeout: ServiceDefaults::DELETE_ASSETS_TIMEOUT,
            array_merge_rules: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Run the durable worker pool. When false, jobs execute inline.
    pub enabled: bool,
    pub pool_size: usize,
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    pub max_attempts: u32,
    #[serde(with = "duration_str")]
    pub index_timeout: Duration,
    #[serde(with = "duration_str")]
    pub delete_timeout: Duration,
    #[serde(with = "duration_str")]
    pub sync_timeout: Duration,
    #[serde(with = "duration_str")]
    pub backoff_base: Duration,
    #[serde(with = "duration_str")]
    pub backoff_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pool_size: WorkerDefaults::POOL_SIZE,
            poll_interval: WorkerDefaults::POLL_INTERVAL,
            max_attempts: WorkerDefaults::MAX_ATTEMPTS,
            index_timeout: WorkerDefaults::INDEX_TIMEOUT,
            delete_timeout: WorkerDefaults::DELETE_TIMEOUT,
            sync_timeout: WorkerDefaults::SYNC_TIMEOUT,
            backoff_base: WorkerDefaults::BACKOFF_BASE,
            backoff_max: WorkerDefaults::BACKOFF_MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub header: String,
    /// Provider stamped on users created implicitly.
    pub provider: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            header: ServiceDefaults::IDENTITY_HEADER.to_string(),
            provider: ServiceDefaults::USER_PROVIDER.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Defaults of the `cleanup` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub dry_run: bool,
    #[serde(with = "duration_str")]
    pub expiry_duration: Duration,
    /// Comma separated services, `*` for all.
    pub services: String,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            expiry_duration: ServiceDefaults::CLEANUP_EXPIRY,
            services: String::new(),
        }
    }
}

impl CompassConfig {
    /// Read a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| CompassError::Config {
            message: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| CompassError::Config {
            message: format!("Failed to parse config {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.delete_assets_timeout.is_zero() {
            return Err(CompassError::Config {
                message: "delete assets timeout must greater than 0 second".to_string(),
            });
        }
        if self.worker.pool_size == 0 {
            return Err(CompassError::Config {
                message: "worker pool size must be at least 1".to_string(),
            });
        }
        if let Some(name) = self
            .service
            .additional_types
            .iter()
            .find(|name| !is_valid_type_name(name))
        {
            return Err(CompassError::Config {
                message: format!("invalid additional asset type {name:?}"),
            });
        }
        if self.identity.header.trim().is_empty() {
            return Err(CompassError::Config {
                message: "identity header cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Serde adapter for durations written as `"90s"`, `"1h30m"` and so on.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use crate::queryexpr::parse_duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    /// Parse a non-negative duration.
    pub fn parse(raw: &str) -> Result<Duration, String> {
        let parsed = parse_duration(raw.trim()).map_err(|e| e.to_string())?;
        parsed
            .to_std()
            .map_err(|_| format!("duration {raw:?} must not be negative"))
    }

    pub fn format(value: Duration) -> String {
        if value.subsec_nanos() == 0 {
            format!("{}s", value.as_secs())
        } else {
            format!("{}ms", value.as_millis())
        }
    }
}
