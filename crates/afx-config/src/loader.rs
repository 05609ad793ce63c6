//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "autoforwardx.toml",
    "config.toml",
    "./config/autoforwardx.toml",
    "/etc/autoforwardx/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("AUTOFORWARDX_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Server
        if let Ok(val) = env::var("AUTOFORWARDX_HTTP_HOST") {
            config.server.host = val;
        }
        if let Ok(val) = env::var("AUTOFORWARDX_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.server.port = port;
            }
        }
        if let Ok(val) = env::var("AUTOFORWARDX_CORS_ORIGINS") {
            config.server.cors_origins = val.split(',').map(|s| s.trim().to_string()).collect();
        }

        // Database
        if let Ok(val) = env::var("AUTOFORWARDX_DATABASE_URL") {
            config.database.url = val;
        }
        if let Ok(val) = env::var("AUTOFORWARDX_DATABASE_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                config.database.max_connections = n;
            }
        }

        // Engine
        if let Ok(val) = env::var("AUTOFORWARDX_WORKERS") {
            if let Ok(n) = val.parse() {
                config.engine.workers = n;
            }
        }
        if let Ok(val) = env::var("AUTOFORWARDX_CLAIM_BATCH") {
            if let Ok(n) = val.parse() {
                config.engine.claim_batch = n;
            }
        }
        if let Ok(val) = env::var("AUTOFORWARDX_MAX_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                config.engine.max_attempts = n;
            }
        }
        if let Ok(val) = env::var("AUTOFORWARDX_INGRESS_BUFFER") {
            if let Ok(n) = val.parse() {
                config.engine.ingress_buffer = n;
            }
        }
        if let Ok(val) = env::var("AUTOFORWARDX_HEALTH_INTERVAL_SECS") {
            if let Ok(n) = val.parse() {
                config.engine.health_interval_secs = n;
            }
        }
        if let Ok(val) = env::var("AUTOFORWARDX_ENFORCE_DAILY_CAP") {
            config.engine.enforce_daily_cap = val == "true" || val == "1";
        }

        // Rate limits
        if let Ok(val) = env::var("AUTOFORWARDX_RATE_LIMIT_PER_MINUTE") {
            if let Ok(n) = val.parse() {
                config.rate_limit.per_minute = n;
            }
        }
        if let Ok(val) = env::var("AUTOFORWARDX_RATE_LIMIT_PER_HOUR") {
            if let Ok(n) = val.parse() {
                config.rate_limit.per_hour = n;
            }
        }
        if let Ok(val) = env::var("AUTOFORWARDX_WARNING_THRESHOLD") {
            if let Ok(n) = val.parse() {
                config.rate_limit.warning_threshold = n;
            }
        }
        if let Ok(val) = env::var("AUTOFORWARDX_CRITICAL_THRESHOLD") {
            if let Ok(n) = val.parse() {
                config.rate_limit.critical_threshold = n;
            }
        }

        // Platform credentials
        if let Ok(val) = env::var("AUTOFORWARDX_API_ID") {
            config.platform.api_id = val;
        }
        if let Ok(val) = env::var("AUTOFORWARDX_API_HASH") {
            config.platform.api_hash = val;
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
