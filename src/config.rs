use crate::manager::{BusScope, JobMode};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Longest per-call timeout accepted, in seconds.
const MAX_CALL_TIMEOUT_SECS: u64 = 3600;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct BusConfig {
    /// Which manager to talk to: "system" or "user"
    #[serde(default)]
    pub scope: BusScope,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JobsConfig {
    /// Job mode used when a command does not pass `--mode`
    #[serde(default)]
    pub mode: JobMode,

    /// Timeout for each call to the manager (0 = none)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// How long to wait for a job to finish (0 = forever)
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            mode: JobMode::default(),
            call_timeout_secs: default_call_timeout(),
            wait_timeout_secs: default_wait_timeout(),
        }
    }
}

impl JobsConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.call_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.wait_timeout_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn default_call_timeout() -> u64 {
    25
}

fn default_wait_timeout() -> u64 {
    90
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily rotated log files (empty = no file logging)
    #[serde(default)]
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: String::new(),
        }
    }
}

impl LoggingConfig {
    pub fn directory(&self) -> Option<PathBuf> {
        let dir = self.directory.trim();
        (!dir.is_empty()).then(|| PathBuf::from(dir))
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("org", "sysjobs", "sysjobs")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Load and validate an explicit config file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate config text
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs.call_timeout_secs > MAX_CALL_TIMEOUT_SECS {
            return Err(ConfigError::ValidationError(format!(
                "call_timeout_secs cannot exceed {} seconds",
                MAX_CALL_TIMEOUT_SECS
            )));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "unknown log level \"{}\" (expected one of: {})",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.logging.directory.contains("..") {
            return Err(ConfigError::ValidationError(
                "log directory contains path traversal sequence (..)".into(),
            ));
        }

        Ok(())
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Create config directory if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;

        info!("Config saved to: {}", path.display());
        Ok(())
    }
}

/// Show current configuration
pub fn show(path: Option<&Path>) -> anyhow::Result<()> {
    let (config, path) = match path {
        Some(path) => (Config::load_from(path)?, path.to_path_buf()),
        None => (Config::load()?, Config::config_path()?),
    };

    println!("Config file: {}\n", path.display());
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bus.scope, BusScope::System);
        assert_eq!(config.jobs.mode, JobMode::Replace);
        assert_eq!(config.jobs.call_timeout_secs, 25);
        assert_eq!(config.jobs.wait_timeout_secs, 90);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.directory().is_none());
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_config() {
        let config = Config::parse(
            r#"
            [bus]
            scope = "user"

            [jobs]
            mode = "ignore-dependencies"
            "#,
        )
        .unwrap();
        assert_eq!(config.bus.scope, BusScope::User);
        assert_eq!(config.jobs.mode, JobMode::IgnoreDependencies);
        assert_eq!(config.jobs.wait_timeout_secs, 90);
    }

    #[test]
    fn test_unknown_scope_rejected() {
        let result = Config::parse("[bus]\nscope = \"cluster\"\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result = Config::parse("[jobs]\nmode = \"eventually\"\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".into();
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("unknown log level"));
    }

    #[test]
    fn test_validate_call_timeout_too_high() {
        let mut config = Config::default();
        config.jobs.call_timeout_secs = 7200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_directory_traversal() {
        let mut config = Config::default();
        config.logging.directory = "/var/log/../../etc".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeouts_disable() {
        let mut config = Config::default();
        assert_eq!(config.jobs.call_timeout(), Some(Duration::from_secs(25)));
        config.jobs.call_timeout_secs = 0;
        config.jobs.wait_timeout_secs = 0;
        assert!(config.jobs.call_timeout().is_none());
        assert!(config.jobs.wait_timeout().is_none());
    }

    #[test]
    fn test_save_and_load_from() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.bus.scope = BusScope::User;
        config.logging.directory = "/tmp/sysjobs-logs".into();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(
            loaded.logging.directory(),
            Some(PathBuf::from("/tmp/sysjobs-logs"))
        );
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = Config::load_from(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }
}
