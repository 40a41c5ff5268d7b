//! Default configuration values for vmi-core

use serde::{Deserialize, Serialize};

/// Default configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDefaults {
    pub dispatch: DispatchDefaults,
    pub wait: WaitDefaults,
    pub registry: RegistryDefaults,
    pub logging: LoggingDefaults,
}

/// Default dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchDefaults {
    pub max_subscriptions: usize,
    pub max_breakpoints: usize,
    pub catch_panics: bool,
}

/// Default wait configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitDefaults {
    pub default_timeout_ms: Option<u64>,
}

/// Default registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDefaults {
    pub case_insensitive_names: bool,
}

/// Default logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingDefaults {
    pub level: String,
    pub with_target: bool,
}

/// Returns the default configuration
pub fn default_config() -> ConfigDefaults {
    ConfigDefaults {
        dispatch: DispatchDefaults {
            max_subscriptions: 1024,
            max_breakpoints: 16,
            catch_panics: true,
        },
        wait: WaitDefaults {
            // Wait forever
            default_timeout_ms: None,
        },
        registry: RegistryDefaults {
            case_insensitive_names: true,
        },
        logging: LoggingDefaults {
            level: "info".to_string(),
            with_target: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_defaults() {
        let config = default_config();
        assert_eq!(config.dispatch.max_subscriptions, 1024);
        assert_eq!(config.dispatch.max_breakpoints, 16);
        assert!(config.dispatch.catch_panics);
    }

    #[test]
    fn test_wait_and_registry_defaults() {
        let config = default_config();
        assert_eq!(config.wait.default_timeout_ms, None);
        assert!(config.registry.case_insensitive_names);
    }

    #[test]
    fn test_logging_defaults() {
        let config = default_config();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.with_target);
    }

    #[test]
    fn test_serialization() {
        let config = default_config();
        let serialized = toml::to_string(&config).unwrap();
        assert!(serialized.contains("max_subscriptions"));
        assert!(serialized.contains("case_insensitive_names"));

        let deserialized: ConfigDefaults = toml::from_str(&serialized).unwrap();
        assert_eq!(
            deserialized.dispatch.max_breakpoints,
            config.dispatch.max_breakpoints
        );
        assert_eq!(deserialized.logging.level, config.logging.level);
    }
}
