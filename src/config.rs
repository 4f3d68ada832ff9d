//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::storage::{StoreConfig, WalSyncMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable names
pub mod env {
    pub const DATA_DIR: &str = "ITEMSTORE_DATA_DIR";
    pub const WAL_SYNC: &str = "ITEMSTORE_WAL_SYNC";
    pub const LOG_LEVEL: &str = "ITEMSTORE_LOG_LEVEL";
    pub const LOG_FORMAT: &str = "ITEMSTORE_LOG_FORMAT";
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub wal_sync: WalSyncMode,

    #[serde(default = "default_checkpoint_wal_bytes")]
    pub checkpoint_wal_bytes: u64,

    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_ms: u64,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("itemstore").to_string_lossy().to_string())
        .unwrap_or_else(|| "./itemstore_data".to_string())
}

fn default_checkpoint_wal_bytes() -> u64 {
    4 * 1024 * 1024 // 4 MB
}

fn default_checkpoint_interval() -> u64 {
    5000 // 5 seconds
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            wal_sync: WalSyncMode::default(),
            checkpoint_wal_bytes: default_checkpoint_wal_bytes(),
            checkpoint_interval_ms: default_checkpoint_interval(),
        }
    }
}

impl StorageConfig {
    /// Data directory with a leading `~` expanded
    pub fn data_path(&self) -> PathBuf {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(&self.data_dir)),
            None => PathBuf::from(&self.data_dir),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Result<Self, ConfigError> {
        // Try default config locations
        let config_paths = [
            dirs::config_dir().map(|p| p.join("itemstore").join("config.toml")),
            Some(PathBuf::from("./itemstore.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        // Fall back to environment-only config
        tracing::debug!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Storage overrides
        if let Some(data_dir) = lookup(env::DATA_DIR) {
            self.storage.data_dir = data_dir;
        }
        if let Some(mode) = lookup(env::WAL_SYNC) {
            self.storage.wal_sync = mode.parse().map_err(|e| ConfigError::Invalid {
                key: env::WAL_SYNC.to_string(),
                error: e,
            })?;
        }

        // Logging overrides
        if let Some(level) = lookup(env::LOG_LEVEL) {
            self.logging.level = level;
        }
        if let Some(format) = lookup(env::LOG_FORMAT) {
            self.logging.format = format;
        }

        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(ConfigError::Invalid {
                    key: "logging.format".to_string(),
                    error: format!("expected \"pretty\" or \"json\", got {:?}", other),
                })
            }
        }
        if self.storage.checkpoint_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "storage.checkpoint_interval_ms".to_string(),
                error: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Runtime settings for the storage engine
    pub fn to_store_config(&self) -> StoreConfig {
        StoreConfig {
            data_dir: self.storage.data_path(),
            wal_sync: self.storage.wal_sync,
            checkpoint_wal_bytes: self.storage.checkpoint_wal_bytes,
            checkpoint_interval_ms: self.storage.checkpoint_interval_ms,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid value for {key}: {error}")]
    Invalid { key: String, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# itemstore Configuration
#
# Environment variables override these settings:
# - ITEMSTORE_DATA_DIR
# - ITEMSTORE_WAL_SYNC
# - ITEMSTORE_LOG_LEVEL
# - ITEMSTORE_LOG_FORMAT

[storage]
# Directory for the WAL and checkpoint files
data_dir = "~/.local/share/itemstore"

# When to fsync the WAL: every_write, batched or none
# Only every_write guarantees a successful commit survives power loss
wal_sync = "every_write"

# WAL size that triggers a background checkpoint (bytes)
checkpoint_wal_bytes = 4194304

# How often the background task checks the WAL size (ms)
checkpoint_interval_ms = 5000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
