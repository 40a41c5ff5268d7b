//! Configuration validator for vmi-core
//!
//! Validates configuration values to ensure they are within acceptable ranges.

use super::loader::{Config, ConfigError, DispatchConfig, LoggingConfig, WaitConfig};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the entire configuration
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        Self::validate_dispatch(&config.dispatch)?;
        Self::validate_wait(&config.wait)?;
        Self::validate_logging(&config.logging)?;
        Ok(())
    }

    /// Validates dispatch limits
    fn validate_dispatch(dispatch: &DispatchConfig) -> Result<(), ConfigError> {
        if dispatch.max_subscriptions == 0 {
            return Err(ConfigError::Invalid(
                "Maximum subscriptions must be at least 1".to_string(),
            ));
        }

        if dispatch.max_breakpoints == 0 {
            return Err(ConfigError::Invalid(
                "Maximum breakpoints must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates wait configuration
    fn validate_wait(wait: &WaitConfig) -> Result<(), ConfigError> {
        if wait.default_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "Default wait timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates logging configuration
    fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                logging.level, valid_levels
            )));
        }

        Ok(())
    }
}

/// Validates a configuration
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    ConfigValidator::validate(config)
}
