//! Provider adapters - uniform capability interface over external image APIs
//!
//! The dispatcher never branches on a provider's name; provider-specific
//! behavior lives behind [`ProviderAdapter`] implementations supplied at
//! construction. [`HttpProviderAdapter`] covers the common case of a JSON
//! HTTP generation endpoint with bearer-token auth.

use async_trait::async_trait;
use pq_common::{GuidanceParams, ImageRef};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failure classification for a single provider call.
///
/// `is_retryable` drives the retry coordinator: transient conditions come
/// back for another attempt, everything else fails the request immediately.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u32 },

    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("prompt rejected by provider: {0}")]
    Rejected(String),

    #[error("authentication failed (HTTP {0})")]
    Auth(u16),

    #[error("provider quota exhausted")]
    QuotaExhausted,

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Connection(_)
                | Self::RateLimited { .. }
                | Self::Server { .. }
                | Self::Malformed(_)
        )
    }
}

/// Capability interface for one external image provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Generate one image. Opaque async call; the dispatcher wraps it in a
    /// timeout and owns all retry policy.
    async fn generate(
        &self,
        prompt: &str,
        guidance: &GuidanceParams,
    ) -> Result<ImageRef, ProviderError>;
}

// ============================================================================
// HTTP Adapter
// ============================================================================

/// Configuration for [`HttpProviderAdapter`]
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Provider name as referenced by submissions.
    pub name: String,
    /// Generation endpoint URL.
    pub endpoint: String,
    /// Bearer token, if the provider requires one.
    pub api_key: Option<String>,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Connection timeout.
    pub connect_timeout: Duration,
}

impl HttpProviderConfig {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            api_key: None,
            timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Request body sent to a generation endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationPayload<'a> {
    prompt: &'a str,
    #[serde(flatten)]
    guidance: &'a GuidanceParams,
}

/// Response body from a generation endpoint
#[derive(Debug, Deserialize)]
struct GenerationResponse {
    #[serde(rename = "imageUrl", alias = "url")]
    image_url: String,
}

/// JSON-over-HTTP provider adapter with bearer auth and status classification
pub struct HttpProviderAdapter {
    client: Client,
    config: HttpProviderConfig,
}

impl HttpProviderAdapter {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        info!(
            provider = %config.name,
            endpoint = %config.endpoint,
            timeout_secs = config.timeout.as_secs(),
            "HttpProviderAdapter initialized"
        );

        Ok(Self { client, config })
    }
}

/// Truncate a response body for inclusion in an error message.
fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn generate(
        &self,
        prompt: &str,
        guidance: &GuidanceParams,
    ) -> Result<ImageRef, ProviderError> {
        let payload = GenerationPayload { prompt, guidance };

        debug!(
            provider = %self.config.name,
            endpoint = %self.config.endpoint,
            "Calling generation endpoint"
        );

        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(&payload);

        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(ProviderError::Timeout(self.config.timeout));
            }
            Err(e) => {
                return Err(ProviderError::Connection(e.to_string()));
            }
        };

        let status = response.status();
        let status_code = status.as_u16();

        if status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|e| ProviderError::Malformed(e.to_string()))?;
            let parsed: GenerationResponse = serde_json::from_str(&body)
                .map_err(|e| ProviderError::Malformed(format!("{}: {}", e, truncate_body(&body))))?;
            return Ok(ImageRef {
                url: parsed.image_url,
                provider: self.config.name.clone(),
            });
        }

        if status_code == 429 {
            // Respect Retry-After when the provider sends one
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(30);
            warn!(
                provider = %self.config.name,
                retry_after = retry_after,
                "Rate limited (429) - will retry"
            );
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if status_code == 401 || status_code == 403 {
            return Err(ProviderError::Auth(status_code));
        }

        if status_code == 402 {
            return Err(ProviderError::QuotaExhausted);
        }

        let body = response.text().await.unwrap_or_default();

        if status.is_server_error() {
            return Err(ProviderError::Server {
                status: status_code,
                message: truncate_body(&body),
            });
        }

        // Remaining 4xx: the provider explicitly refused this request
        Err(ProviderError::Rejected(format!(
            "HTTP {}: {}",
            status_code,
            truncate_body(&body)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ProviderError::Connection("reset".into()).is_retryable());
        assert!(ProviderError::RateLimited {
            retry_after_secs: 30
        }
        .is_retryable());
        assert!(ProviderError::Server {
            status: 503,
            message: "overloaded".into()
        }
        .is_retryable());

        assert!(!ProviderError::Rejected("nsfw prompt".into()).is_retryable());
        assert!(!ProviderError::Auth(401).is_retryable());
        assert!(!ProviderError::QuotaExhausted.is_retryable());
    }

    #[test]
    fn truncates_long_bodies() {
        let long = "x".repeat(500);
        let truncated = truncate_body(&long);
        assert!(truncated.len() <= 203);
        assert!(truncated.ends_with("..."));
    }
}
