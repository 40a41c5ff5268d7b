//! Configuration loader for vmi-core
//!
//! Reads a TOML file; any section or key it leaves out takes its value from
//! [`default_config`].

use super::defaults::default_config;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dispatch: DispatchConfig,
    pub wait: WaitConfig,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
}

/// Subscription and breakpoint limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_subscriptions: usize,
    pub max_breakpoints: usize,
    pub catch_panics: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let dispatch = default_config().dispatch;
        DispatchConfig {
            max_subscriptions: dispatch.max_subscriptions,
            max_breakpoints: dispatch.max_breakpoints,
            catch_panics: dispatch.catch_panics,
        }
    }
}

/// Wait configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub default_timeout_ms: Option<u64>,
}

impl Default for WaitConfig {
    fn default() -> Self {
        WaitConfig {
            default_timeout_ms: default_config().wait.default_timeout_ms,
        }
    }
}

/// Registry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub case_insensitive_names: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            case_insensitive_names: default_config().registry.case_insensitive_names,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let logging = default_config().logging;
        LoggingConfig {
            level: logging.level,
            with_target: logging.with_target,
        }
    }
}

/// Reads configuration from a TOML file
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        ConfigLoader {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Reads and parses the file
    pub fn load(&self) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(&self.path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => ConfigError::FileNotFound(self.path.display().to_string()),
            _ => ConfigError::Io(err),
        })?;
        Ok(toml::from_str(&contents)?)
    }
}
