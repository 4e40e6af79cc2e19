//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::index::DEFAULT_STRIPE_SIZE;
use crate::manager::HeadManagerOptions;
use crate::storage::layout::Period;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub head: HeadConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Head manager configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HeadConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_store_name")]
    pub store_name: String,

    #[serde(default = "default_rotation_period")]
    pub rotation_period_secs: u64,

    #[serde(default = "default_stripe_size")]
    pub stripe_size: usize,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("chronicle-head").to_string_lossy().to_string())
        .unwrap_or_else(|| "./chronicle_head_data".to_string())
}

fn default_store_name() -> String {
    "index".to_string()
}

fn default_rotation_period() -> u64 {
    15 * 60 // 15 minutes
}

fn default_stripe_size() -> usize {
    DEFAULT_STRIPE_SIZE
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store_name: default_store_name(),
            rotation_period_secs: default_rotation_period(),
            stripe_size: default_stripe_size(),
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

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        // Try default config locations
        let config_paths = [
            dirs::config_dir().map(|p| p.join("chronicle-head").join("config.toml")),
            Some(PathBuf::from("/etc/chronicle-head/config.toml")),
            Some(PathBuf::from("./chronicle-head.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        // Fall back to environment-only config
        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Head overrides
        if let Ok(data_dir) = std::env::var("CHRONICLE_HEAD_DATA_DIR") {
            self.head.data_dir = data_dir;
        }
        if let Ok(store) = std::env::var("CHRONICLE_HEAD_STORE") {
            self.head.store_name = store;
        }
        if let Ok(secs) = std::env::var("CHRONICLE_HEAD_ROTATION_SECS") {
            if let Ok(s) = secs.parse() {
                self.head.rotation_period_secs = s;
            }
        }

        // Logging overrides
        if let Ok(level) = std::env::var("CHRONICLE_HEAD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("CHRONICLE_HEAD_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Validated head manager options
    pub fn manager_options(&self) -> Result<HeadManagerOptions, ConfigError> {
        if self.head.rotation_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "head.rotation_period_secs must be positive".to_string(),
            ));
        }
        if self.head.stripe_size == 0 {
            return Err(ConfigError::Invalid(
                "head.stripe_size must be positive".to_string(),
            ));
        }

        Ok(HeadManagerOptions {
            period: Period::new(Duration::from_secs(self.head.rotation_period_secs)),
            stripe_size: self.head.stripe_size,
            ..HeadManagerOptions::default()
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# chronicle-head Configuration
#
# Environment variables override these settings:
# - CHRONICLE_HEAD_DATA_DIR
# - CHRONICLE_HEAD_STORE
# - CHRONICLE_HEAD_ROTATION_SECS
# - CHRONICLE_HEAD_LOG_LEVEL
# - CHRONICLE_HEAD_LOG_FORMAT

[head]
# Root directory; the store lives in <data_dir>/<store_name>
data_dir = "~/.local/share/chronicle-head"

# Store name
store_name = "index"

# Rotation period (seconds)
rotation_period_secs = 900

# Lock stripes per tenant series index
stripe_size = 128

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
