//! AutoForwardX configuration.
//!
//! TOML-based configuration with environment variable overrides. Invalid
//! values are rejected at startup (`validate()`), before any component is
//! wired up.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub rate_limit: RateLimitConfig,
    pub platform: PlatformConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            engine: EngineConfig::default(),
            rate_limit: RateLimitConfig::default(),
            platform: PlatformConfig::default(),
        }
    }
}

/// HTTP control-plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: vec!["http://localhost:4200".to_string()],
        }
    }
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://autoforwardx.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Forwarding engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of delivery workers
    pub workers: u32,
    /// Queue items claimed per worker poll
    pub claim_batch: u32,
    /// Delivery attempts before an item is marked failed
    pub max_attempts: u32,
    /// Per-session inbound update buffer capacity
    pub ingress_buffer: u32,
    /// Session health probe interval in seconds
    pub health_interval_secs: u64,
    /// Reject enqueue once a user's daily message count is exhausted
    pub enforce_daily_cap: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            claim_batch: 32,
            max_attempts: 3,
            ingress_buffer: 256,
            health_interval_secs: 300,
            enforce_daily_cap: false,
        }
    }
}

/// Per-session send budget and anti-ban thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
    /// Fraction of the budget at which a session enters `warning`
    pub warning_threshold: f64,
    /// Fraction of the budget at which a session enters `critical`
    pub critical_threshold: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 20,
            per_hour: 300,
            warning_threshold: 0.80,
            critical_threshold: 0.95,
        }
    }
}

/// Platform API credentials, passed through to the client library opaquely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub api_id: String,
    pub api_hash: String,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Reject configurations that would misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.workers == 0 {
            return Err(ConfigError::ValidationError(
                "engine.workers must be at least 1".into(),
            ));
        }
        if self.engine.claim_batch == 0 {
            return Err(ConfigError::ValidationError(
                "engine.claim_batch must be at least 1".into(),
            ));
        }
        if self.engine.ingress_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "engine.ingress_buffer must be at least 1".into(),
            ));
        }
        if self.rate_limit.per_minute == 0 || self.rate_limit.per_hour == 0 {
            return Err(ConfigError::ValidationError(
                "rate_limit budgets must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.rate_limit.warning_threshold)
            || !(0.0..=1.0).contains(&self.rate_limit.critical_threshold)
        {
            return Err(ConfigError::ValidationError(
                "rate_limit thresholds must be within [0, 1]".into(),
            ));
        }
        if self.rate_limit.warning_threshold > self.rate_limit.critical_threshold {
            return Err(ConfigError::ValidationError(
                "rate_limit.warning_threshold must not exceed critical_threshold".into(),
            ));
        }
        if self.database.url.is_empty() {
            return Err(ConfigError::ValidationError(
                "database.url must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# AutoForwardX Configuration
# Environment variables (AUTOFORWARDX_*) override these settings

[server]
host = "0.0.0.0"
port = 8080
cors_origins = ["http://localhost:4200"]

[database]
url = "sqlite://autoforwardx.db"
max_connections = 5

[engine]
workers = 16
claim_batch = 32
max_attempts = 3
ingress_buffer = 256
health_interval_secs = 300
enforce_daily_cap = false

[rate_limit]
per_minute = 20
per_hour = 300
warning_threshold = 0.80
critical_threshold = 0.95

[platform]
api_id = ""
api_hash = ""
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.engine.workers, 16);
        assert_eq!(config.rate_limit.per_minute, 20);
        assert_eq!(config.rate_limit.per_hour, 300);
    }

    #[test]
    fn example_toml_parses() {
        let config: AppConfig = toml::from_str(&AppConfig::example_toml()).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nworkers = 4").unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.engine.claim_batch, 32);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn zero_workers_rejected() {
        let config: AppConfig = toml::from_str("[engine]\nworkers = 0").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let config: AppConfig =
            toml::from_str("[rate_limit]\nwarning_threshold = 0.99\ncritical_threshold = 0.5")
                .unwrap();
        assert!(config.validate().is_err());
    }
}
