use crate::messaging::ConsumerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming an optional config file
pub const CONFIG_PATH_ENV: &str = "SNEAKER_CONFIG";

/// Config file read when [`CONFIG_PATH_ENV`] is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/sneaker.toml";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Consumer connection and subscription defaults
    #[serde(default)]
    pub messaging: ConsumerConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the built-in defaults, an optional file and
    /// the environment.
    ///
    /// The file is `$SNEAKER_CONFIG`, or `config/sneaker.toml` when unset; a
    /// missing file is not an error. Environment variables use the `SNEAKER_`
    /// prefix and `__` between nested keys, e.g. `SNEAKER_MESSAGING__URL`.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&config_path)
    }

    /// Load configuration using `path` as the optional file layer
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::from(path.as_ref()).required(false))
            // Override with environment variables (prefix: SNEAKER_)
            .add_source(
                config::Environment::with_prefix("SNEAKER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        self.messaging.validate()?;
        if self.observability.log_level.trim().is_empty() {
            return Err(crate::error::AppError::Configuration(
                "observability.log_level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            prometheus_enabled: default_true(),
        }
    }
}

fn default_log_level() -> String {
    "sneaker=info".to_string()
}

fn default_true() -> bool {
    true
}
