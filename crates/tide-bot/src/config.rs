//! Application configuration.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tide_delivery::{DeliveryConfig, RoutingConfig};
use tide_gate::{AggregationConfig, ThrottleConfig};
use tide_persistence::PersistenceConfig;
use tide_telemetry::LoggingConfig;

/// Environment variable prefix for overrides (`TIDE__DELIVERY__MAX_RETRIES=5`).
const ENV_PREFIX: &str = "TIDE";
const ENV_SEPARATOR: &str = "__";

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Serve the HTTP API. Default: true.
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    /// Bind address. Default: 127.0.0.1.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Port. Default: 8080.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_api_enabled() -> bool {
    true
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub telemetry: LoggingConfig,
}

impl AppConfig {
    /// Load from `path` (optional) with `TIDE__*` environment overrides, then
    /// validate.
    pub fn load(path: &str) -> AppResult<Self> {
        if !Path::new(path).exists() {
            tracing::warn!(path = %path, "Config file not found, using defaults and environment");
        }

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .list_separator(",")
                    .with_list_parse_key("delivery.recoverable_statuses")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Config(format!("Failed to load config: {e}")))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file without environment overrides.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section once. Misconfiguration is fatal at startup.
    pub fn validate(&self) -> AppResult<()> {
        self.throttle.validate()?;
        self.aggregation.validate()?;
        self.delivery.validate()?;
        self.routing.validate()?;
        self.persistence.validate()?;

        if self.api.enabled && self.api.port == 0 {
            return Err(AppError::Config("api.port must be non-zero".to_string()));
        }
        if self.routing.destinations.is_empty() {
            tracing::warn!("No destinations configured; every submission will be NoDestination");
        }
        Ok(())
    }
}
