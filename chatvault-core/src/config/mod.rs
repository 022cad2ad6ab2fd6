//! Configuration management for chatvault
//!
//! Two layers live here:
//! - [`VaultSettings`]: process settings (paths, I/O deadline, logging),
//!   loaded from the environment or a TOML file
//! - [`StorageConfig`]: the storage policy persisted inside the vault and
//!   managed by [`ConfigStore`]

use crate::logging::{LogConfig, LogLevel};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

mod error;
pub mod policy;

pub use error::ConfigError;
pub use policy::{ConfigStore, StorageConfig, StorageConfigUpdate};

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSettings {
    /// Directory for chat records
    pub data_dir: PathBuf,

    /// Secure keystore directory; `None` means no secure keystore
    pub key_dir: Option<PathBuf>,

    /// Deadline for each persistent store call
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./chatvault-data"),
            key_dir: Some(PathBuf::from("./chatvault-data/keys")),
            io_timeout: Duration::from_secs(10),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl LoggingSettings {
    /// Subscriber configuration for these settings
    pub fn to_log_config(&self) -> LogConfig {
        let level = LogLevel::from_str(&self.level).unwrap_or_default();
        LogConfig::new(level).json_format(self.json_format)
    }
}

impl VaultSettings {
    /// Load settings from environment variables
    ///
    /// Variables: CHATVAULT_DATA_DIR, CHATVAULT_KEY_DIR (empty disables the
    /// secure keystore), CHATVAULT_IO_TIMEOUT (e.g. "5s"),
    /// CHATVAULT_LOG_LEVEL, CHATVAULT_LOG_JSON
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Ok(data_dir) = env::var("CHATVAULT_DATA_DIR") {
            settings.data_dir = PathBuf::from(&data_dir);
            settings.key_dir = Some(PathBuf::from(data_dir).join("keys"));
        }
        if let Ok(key_dir) = env::var("CHATVAULT_KEY_DIR") {
            settings.key_dir = if key_dir.is_empty() {
                None
            } else {
                Some(PathBuf::from(key_dir))
            };
        }
        if let Ok(timeout) = env::var("CHATVAULT_IO_TIMEOUT") {
            settings.io_timeout = humantime_serde::re::humantime::parse_duration(&timeout)
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid I/O timeout: {}", e)))?;
        }
        if let Ok(level) = env::var("CHATVAULT_LOG_LEVEL") {
            settings.logging.level = level;
        }
        if let Ok(json) = env::var("CHATVAULT_LOG_JSON") {
            settings.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid JSON flag: {}", e)))?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let settings: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "data_dir must not be empty".to_string(),
            ));
        }

        if self.io_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "io_timeout must be greater than 0".to_string(),
            ));
        }

        if LogLevel::from_str(&self.logging.level).is_none() {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save settings to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}
