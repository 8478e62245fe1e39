//! Configuration management for the searchgate server.
//!
//! Configuration is layered from:
//! 1. Default values (hardcoded)
//! 2. Configuration file (YAML)
//! 3. Environment variables (override)
//!
//! Environment variables use the `SEARCHGATE_` prefix and `__` as the nested
//! key separator, e.g. `SEARCHGATE_CACHE__AUTH_TTL_MS=30000`.
//!
//! # Example
//!
//! ```ignore
//! use searchgate_server::config::ServerConfig;
//!
//! let config = ServerConfig::load("config.yaml")?;
//! let config = ServerConfig::from_env()?;
//! ```

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use searchgate_domain::{CacheConfig, InvalidatorConfig};
use searchgate_storage::{PostgresConfig, DEFAULT_NOTIFICATION_CHANNEL};

use crate::k8s::ClientCacheLimits;
use crate::notification::EngineConfig;

/// Server configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub notification: NotificationSettings,

    #[serde(default)]
    pub features: FeatureSettings,

    #[serde(default)]
    pub invalidation: InvalidationSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Cache tier settings. Durations are in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CacheSettings {
    #[serde(default = "default_auth_ttl_ms")]
    pub auth_ttl_ms: u64,

    #[serde(default = "default_grant_ttl_ms")]
    pub shared_ttl_ms: u64,

    #[serde(default = "default_grant_ttl_ms")]
    pub user_ttl_ms: u64,

    #[serde(default = "default_grant_ttl_ms")]
    pub watch_ttl_ms: u64,

    /// Quiet period of the debounced invalidation.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_review_concurrency")]
    pub review_concurrency: usize,

    #[serde(default = "default_external_call_timeout_ms")]
    pub external_call_timeout_ms: u64,

    #[serde(default = "default_identity_capacity")]
    pub identity_capacity: u64,

    /// Most impersonating API clients kept at once.
    #[serde(default = "default_impersonation_clients")]
    pub impersonation_clients: u64,

    #[serde(default = "default_impersonation_idle_ms")]
    pub impersonation_idle_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            auth_ttl_ms: default_auth_ttl_ms(),
            shared_ttl_ms: default_grant_ttl_ms(),
            user_ttl_ms: default_grant_ttl_ms(),
            watch_ttl_ms: default_grant_ttl_ms(),
            debounce_ms: default_debounce_ms(),
            review_concurrency: default_review_concurrency(),
            external_call_timeout_ms: default_external_call_timeout_ms(),
            identity_capacity: default_identity_capacity(),
            impersonation_clients: default_impersonation_clients(),
            impersonation_idle_ms: default_impersonation_idle_ms(),
        }
    }
}

fn default_auth_ttl_ms() -> u64 {
    60_000
}

fn default_grant_ttl_ms() -> u64 {
    300_000
}

fn default_debounce_ms() -> u64 {
    5_000
}

fn default_review_concurrency() -> usize {
    32
}

fn default_external_call_timeout_ms() -> u64 {
    10_000
}

fn default_identity_capacity() -> u64 {
    10_000
}

fn default_impersonation_clients() -> u64 {
    1_000
}

fn default_impersonation_idle_ms() -> u64 {
    600_000
}

/// Storage settings.
#[derive(Clone, Deserialize, Serialize, PartialEq)]
pub struct StorageSettings {
    /// Storage backend: "memory" or "postgres"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Database connection URL (required for postgres)
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

// Custom Debug implementation to hide credentials in database_url
impl std::fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSettings")
            .field("backend", &self.backend)
            .field("database_url", &self.database_url.as_ref().map(|_| "[REDACTED]"))
            .field("pool_size", &self.pool_size)
            .field("connection_timeout_secs", &self.connection_timeout_secs)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .finish()
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_url: None,
            pool_size: default_pool_size(),
            connection_timeout_secs: default_connection_timeout(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_query_timeout() -> u64 {
    30
}

/// Change notification settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NotificationSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_channel")]
    pub channel: String,

    /// Consecutive reconnect attempts before the engine stops.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Bounded delivery queue size per subscription.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Create the row-change trigger on startup.
    #[serde(default)]
    pub install_trigger: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: default_channel(),
            max_retries: default_max_retries(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            queue_capacity: default_queue_capacity(),
            install_trigger: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_channel() -> String {
    DEFAULT_NOTIFICATION_CHANNEL.to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_queue_capacity() -> usize {
    100
}

/// Optional features.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct FeatureSettings {
    /// Resolve fine-grained permission records in addition to RBAC reviews.
    #[serde(default)]
    pub fine_grained_rbac: bool,
}

/// Background invalidator settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct InvalidationSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Pause before a watch loop that exited is restarted.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for InvalidationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

fn default_restart_delay_ms() -> u64 {
    5_000
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format for logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ServerConfig {
    /// Load configuration from a YAML file with environment variable overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&ServerConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            // SEARCHGATE_CACHE__AUTH_TTL_MS -> cache.auth_ttl_ms
            .add_source(
                Environment::with_prefix("SEARCHGATE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&ServerConfig::default())?)
            .add_source(
                Environment::with_prefix("SEARCHGATE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let ttls = [
            ("cache.auth_ttl_ms", self.cache.auth_ttl_ms),
            ("cache.shared_ttl_ms", self.cache.shared_ttl_ms),
            ("cache.user_ttl_ms", self.cache.user_ttl_ms),
            ("cache.watch_ttl_ms", self.cache.watch_ttl_ms),
            ("cache.impersonation_idle_ms", self.cache.impersonation_idle_ms),
        ];
        if let Some((name, _)) = ttls.iter().find(|(_, ttl)| *ttl == 0) {
            return Err(ConfigLoadError::Invalid {
                message: format!("{name} must be greater than 0"),
            });
        }

        if self.cache.review_concurrency == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "cache.review_concurrency must be greater than 0".to_string(),
            });
        }

        if self.notification.queue_capacity == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "notification.queue_capacity must be greater than 0".to_string(),
            });
        }

        if let Err(e) = searchgate_storage::validate_channel_name(&self.notification.channel) {
            return Err(ConfigLoadError::Invalid {
                message: format!("notification.channel: {e}"),
            });
        }

        let valid_backends = ["memory", "postgres"];
        if !valid_backends.contains(&self.storage.backend.as_str()) {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "storage.backend must be one of: {:?}, got: {}",
                    valid_backends, self.storage.backend
                ),
            });
        }

        if self.storage.backend == "postgres"
            && self
                .storage
                .database_url
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
        {
            return Err(ConfigLoadError::Invalid {
                message: "storage.database_url is required when backend is 'postgres'".to_string(),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "logging.level must be one of: {:?}, got: {}",
                    valid_levels, self.logging.level
                ),
            });
        }

        Ok(())
    }

    /// Settings for the identity, grant and watch caches.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            auth_ttl: Duration::from_millis(self.cache.auth_ttl_ms),
            shared_ttl: Duration::from_millis(self.cache.shared_ttl_ms),
            user_ttl: Duration::from_millis(self.cache.user_ttl_ms),
            watch_ttl: Duration::from_millis(self.cache.watch_ttl_ms),
            identity_capacity: self.cache.identity_capacity,
            review_concurrency: self.cache.review_concurrency,
            external_call_timeout: Duration::from_millis(self.cache.external_call_timeout_ms),
            fine_grained: self.features.fine_grained_rbac,
        }
    }

    pub fn invalidator_config(&self) -> InvalidatorConfig {
        InvalidatorConfig::default()
            .with_quiet_period(Duration::from_millis(self.cache.debounce_ms))
            .with_restart_delay(Duration::from_millis(self.invalidation.restart_delay_ms))
    }

    pub fn client_cache_limits(&self) -> ClientCacheLimits {
        ClientCacheLimits {
            max_clients: self.cache.impersonation_clients,
            idle: Duration::from_millis(self.cache.impersonation_idle_ms),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            channel: self.notification.channel.clone(),
            max_retries: self.notification.max_retries,
            reconnect_delay: Duration::from_millis(self.notification.reconnect_delay_ms),
            queue_capacity: self.notification.queue_capacity,
        }
    }

    /// Postgres settings, if the postgres backend is selected.
    pub fn postgres_config(&self) -> Option<PostgresConfig> {
        if self.storage.backend != "postgres" {
            return None;
        }
        let database_url = self.storage.database_url.clone()?;
        Some(PostgresConfig {
            database_url,
            max_connections: self.storage.pool_size,
            min_connections: 1,
            connect_timeout_secs: self.storage.connection_timeout_secs,
            query_timeout_secs: self.storage.query_timeout_secs,
            ..Default::default()
        })
    }
}
