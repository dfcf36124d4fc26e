//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "pixelqueue.toml",
    "./config/config.toml",
    "/etc/pixelqueue/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
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
        // Start with defaults
        let mut config = AppConfig::default();

        // Try to load from file
        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // Check explicit path first
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        // Check PIXELQUEUE_CONFIG env var
        if let Ok(path) = env::var("PIXELQUEUE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // Search standard paths
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
        // HTTP
        if let Ok(val) = env::var("PIXELQUEUE_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("PIXELQUEUE_HTTP_HOST") {
            config.http.host = val;
        }
        if let Ok(val) = env::var("PIXELQUEUE_CORS_ORIGINS") {
            config.http.cors_origins = val.split(',').map(|s| s.trim().to_string()).collect();
        }

        // Queue
        if let Ok(val) = env::var("PIXELQUEUE_MAX_QUEUE_DEPTH") {
            if let Ok(depth) = val.parse() {
                config.queue.max_queue_depth = depth;
            }
        }
        if let Ok(val) = env::var("PIXELQUEUE_WARN_THRESHOLD") {
            if let Ok(threshold) = val.parse() {
                config.queue.warn_threshold = threshold;
            }
        }
        if let Ok(val) = env::var("PIXELQUEUE_DEDUP_WINDOW_MS") {
            if let Ok(ms) = val.parse() {
                config.queue.dedup_window_ms = ms;
            }
        }
        if let Ok(val) = env::var("PIXELQUEUE_RETENTION_TTL_MS") {
            if let Ok(ms) = val.parse() {
                config.queue.retention_ttl_ms = ms;
            }
        }

        // Retry
        if let Ok(val) = env::var("PIXELQUEUE_RETRY_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse() {
                config.retry.max_attempts = attempts;
            }
        }
        if let Ok(val) = env::var("PIXELQUEUE_RETRY_BACKOFF_BASE_MS") {
            if let Ok(ms) = val.parse() {
                config.retry.backoff_base_ms = ms;
            }
        }

        // Circuit breaker
        if let Ok(val) = env::var("PIXELQUEUE_BREAKER_FAILURE_THRESHOLD") {
            if let Ok(threshold) = val.parse() {
                config.breaker.failure_threshold = threshold;
            }
        }
        if let Ok(val) = env::var("PIXELQUEUE_BREAKER_COOLDOWN_MS") {
            if let Ok(ms) = val.parse() {
                config.breaker.cooldown_ms = ms;
            }
        }

        // Dev mode
        if let Ok(val) = env::var("PIXELQUEUE_DEV_MODE") {
            config.dev_mode = val == "true" || val == "1";
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
