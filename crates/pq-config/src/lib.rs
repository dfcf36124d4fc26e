//! PixelQueue Configuration System
//!
//! This crate provides TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
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
    pub http: HttpConfig,
    pub queue: QueueSettings,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    /// One entry per external image provider.
    #[serde(rename = "provider")]
    pub providers: Vec<ProviderSettings>,

    /// Enable development mode (permissive credit gate, built-in test provider)
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            queue: QueueSettings::default(),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            providers: Vec::new(),
            dev_mode: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate the configuration, rejecting values the queue cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "queue.max_queue_depth must be at least 1".into(),
            ));
        }
        if self.queue.warn_threshold >= self.queue.max_queue_depth {
            return Err(ConfigError::ValidationError(format!(
                "queue.warn_threshold ({}) must be below max_queue_depth ({})",
                self.queue.warn_threshold, self.queue.max_queue_depth
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !self.dev_mode && self.providers.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one [[provider]] must be configured".into(),
            ));
        }
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "provider.name must not be empty".into(),
                ));
            }
            if provider.limit == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "provider {} has a zero concurrency limit",
                    provider.name
                )));
            }
            if self
                .providers
                .iter()
                .filter(|p| p.name == provider.name)
                .count()
                > 1
            {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            cors_origins: vec!["*".to_string()],
        }
    }
}

/// Admission and retention settings for the request queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum pending (Queued/Dispatched/Retrying) requests before QueueFull.
    pub max_queue_depth: usize,
    /// Pending depth at which the health verdict degrades to warning.
    pub warn_threshold: usize,
    /// Oldest-request age at which the health verdict degrades to warning.
    pub age_warn_threshold_ms: u64,
    /// Window during which identical resubmissions are suppressed.
    pub dedup_window_ms: u64,
    /// How long terminal requests stay visible before eviction.
    pub retention_ttl_ms: u64,
    /// Interval of the background eviction sweep.
    pub sweep_interval_ms: u64,
    /// Maximum accepted prompt length in characters.
    pub max_prompt_chars: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_depth: 100,
            warn_threshold: 75,
            age_warn_threshold_ms: 60_000,
            dedup_window_ms: 5_000,
            retention_ttl_ms: 300_000,
            sweep_interval_ms: 30_000,
            max_prompt_chars: 10_000,
        }
    }
}

impl QueueSettings {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn retention_ttl(&self) -> Duration {
        Duration::from_millis(self.retention_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn age_warn_threshold(&self) -> Duration {
        Duration::from_millis(self.age_warn_threshold_ms)
    }
}

/// Retry policy for transient provider failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total dispatch attempts per request, including the first.
    pub max_attempts: u32,
    /// Base backoff delay; doubled per attempt.
    pub backoff_base_ms: u64,
    /// Upper bound on any single backoff delay.
    pub backoff_max_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetrySettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Circuit breaker settings, shared by all providers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects dispatches before half-opening.
    pub cooldown_ms: u64,
    /// Successes required in half-open state to close the circuit.
    pub half_open_successes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            half_open_successes: 1,
        }
    }
}

impl BreakerSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Configuration for one external image provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider name, referenced by submissions.
    pub name: String,
    /// Generation endpoint URL.
    pub endpoint: String,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Max concurrent in-flight dispatches.
    #[serde(default = "default_provider_limit")]
    pub limit: u32,
    /// Per-call timeout.
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
    /// Optional requests-per-minute cap, honoring the upstream API's limits.
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
}

fn default_provider_limit() -> u32 {
    2
}

fn default_provider_timeout_ms() -> u64 {
    120_000
}

impl ProviderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_provider() -> AppConfig {
        let mut config = AppConfig::default();
        config.providers.push(ProviderSettings {
            name: "flux".to_string(),
            endpoint: "https://api.example.com/v1/generate".to_string(),
            api_key_env: Some("FLUX_API_KEY".to_string()),
            limit: 2,
            timeout_ms: 60_000,
            rate_limit_per_minute: None,
        });
        config
    }

    #[test]
    fn default_config_is_valid_in_dev_mode() {
        let mut config = AppConfig::default();
        config.dev_mode = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_missing_providers_outside_dev_mode() {
        let config = AppConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn rejects_zero_provider_limit() {
        let mut config = config_with_provider();
        config.providers[0].limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_warn_threshold_at_capacity() {
        let mut config = config_with_provider();
        config.queue.warn_threshold = config.queue.max_queue_depth;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_provider_names() {
        let mut config = config_with_provider();
        let dup = config.providers[0].clone();
        config.providers.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_provider_table() {
        let toml = r#"
            dev_mode = false

            [queue]
            max_queue_depth = 50
            warn_threshold = 40

            [[provider]]
            name = "flux"
            endpoint = "https://api.example.com/v1/generate"
            limit = 4
            rate_limit_per_minute = 120
        "#;

        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.queue.max_queue_depth, 50);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].limit, 4);
        assert_eq!(config.providers[0].rate_limit_per_minute, Some(120));
        // Defaults fill unspecified fields
        assert_eq!(config.providers[0].timeout_ms, 120_000);
        assert!(config.validate().is_ok());
    }
}
