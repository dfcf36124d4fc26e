//! PixelQueue Production Server
//!
//! Admits generation requests over HTTP, dispatches them to the configured
//! image providers, and exposes the operator snapshot and admin surface.
//!
//! ## Configuration
//!
//! Reads `config.toml` / `pixelqueue.toml` (or `PIXELQUEUE_CONFIG`) with
//! `PIXELQUEUE_*` environment overrides; see the pq-config crate.
//!
//! ## Development Mode
//!
//! Set `PIXELQUEUE_DEV_MODE=true` (or `dev_mode = true`) to enable:
//! - A built-in `dev` provider that returns placeholder images
//! - An unmetered credit gate when no billing service is configured

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, Notify};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use pq_common::{GuidanceParams, ImageRef};
use pq_config::{AppConfig, ConfigLoader};
use pq_dispatch::{
    api::create_router, spawn_retention_sweep, AdmissionConfig, AdmissionController,
    BreakerConfig, CreditGate, HealthMonitor, HealthThresholds, HttpProviderAdapter,
    HttpProviderConfig, NoOpHooks, ProviderAdapter, ProviderDispatcher, ProviderError,
    ProviderRuntime, QueueInspector, RequestQueue, RetryCoordinator, RetryPolicy,
    UnmeteredCreditGate,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    pq_common::logging::init_logging("pq-server");

    info!("Starting PixelQueue Generation Server");

    // 1. Load and validate configuration
    let config = ConfigLoader::new()
        .load()
        .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // 2. Build the request queue and shared work signal
    let work_notify = Arc::new(Notify::new());
    let queue = Arc::new(RequestQueue::new(
        config.queue.max_queue_depth,
        config.queue.retention_ttl(),
    ));

    // 3. Retry coordination
    let retry = Arc::new(RetryCoordinator::new(
        queue.clone(),
        RetryPolicy {
            max_attempts: config.retry.max_attempts,
            backoff_base: config.retry.backoff_base(),
            backoff_max: config.retry.backoff_max(),
        },
        work_notify.clone(),
    ));

    // 4. Provider adapters from configuration
    let providers = build_providers(&config)?;
    if providers.is_empty() {
        anyhow::bail!("No providers available; configure [[provider]] or enable dev_mode");
    }

    // 5. Dispatcher with per-provider budgets and circuit breakers
    let dispatcher = Arc::new(ProviderDispatcher::new(
        queue.clone(),
        retry,
        Arc::new(NoOpHooks),
        providers,
        BreakerConfig {
            failure_threshold: config.breaker.failure_threshold,
            cooldown: config.breaker.cooldown(),
            half_open_successes: config.breaker.half_open_successes,
        },
        work_notify.clone(),
    ));
    dispatcher.start();

    // 6. Admission with the external credit gate
    let credit = build_credit_gate(&config);
    let admission = Arc::new(AdmissionController::new(
        queue.clone(),
        dispatcher.clone(),
        credit,
        AdmissionConfig {
            dedup_window: config.queue.dedup_window(),
            max_prompt_chars: config.queue.max_prompt_chars,
        },
    ));

    // 7. Inspector for the operator surface
    let inspector = Arc::new(QueueInspector::new(
        queue.clone(),
        dispatcher.clone(),
        HealthMonitor::new(HealthThresholds {
            max_queue_depth: config.queue.max_queue_depth,
            warn_threshold: config.queue.warn_threshold,
            age_warn_threshold: config.queue.age_warn_threshold(),
        }),
    ));

    // 8. Background retention sweep
    let (shutdown_tx, _) = broadcast::channel(1);
    spawn_retention_sweep(
        queue.clone(),
        admission.clone(),
        config.queue.sweep_interval(),
        shutdown_tx.clone(),
    );

    // 9. HTTP server
    let app = create_router(admission.clone(), inspector, dispatcher.clone())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // 10. Graceful shutdown: stop admitting, let in-flight dispatches finish
    info!("Shutting down");
    admission.close();
    let _ = shutdown_tx.send(());
    dispatcher.shutdown(Duration::from_secs(30)).await;
    info!("Shutdown complete");

    Ok(())
}

/// Build provider runtimes from configuration. In dev mode a built-in `dev`
/// provider is added when none are configured.
fn build_providers(config: &AppConfig) -> Result<Vec<ProviderRuntime>> {
    let mut providers = Vec::new();

    for settings in &config.providers {
        let api_key = match &settings.api_key_env {
            Some(var) => match std::env::var(var) {
                Ok(key) => Some(key),
                Err(_) => {
                    error!(
                        provider = %settings.name,
                        env_var = %var,
                        "API key environment variable not set"
                    );
                    anyhow::bail!("Missing API key for provider {}", settings.name);
                }
            },
            None => None,
        };

        let adapter = HttpProviderAdapter::new(HttpProviderConfig {
            name: settings.name.clone(),
            endpoint: settings.endpoint.clone(),
            api_key,
            timeout: settings.timeout(),
            connect_timeout: Duration::from_secs(10),
        })
        .map_err(|e| anyhow::anyhow!("Failed to build adapter for {}: {}", settings.name, e))?;

        providers.push(ProviderRuntime {
            name: settings.name.clone(),
            adapter: Arc::new(adapter),
            limit: settings.limit,
            timeout: settings.timeout(),
            rate_limit_per_minute: settings.rate_limit_per_minute,
        });
    }

    if providers.is_empty() && config.dev_mode {
        info!("Dev mode: registering built-in placeholder provider");
        providers.push(ProviderRuntime {
            name: "dev".to_string(),
            adapter: Arc::new(DevProviderAdapter),
            limit: 2,
            timeout: Duration::from_secs(10),
            rate_limit_per_minute: None,
        });
    }

    Ok(providers)
}

/// Select the credit gate: an HTTP billing service when configured, otherwise
/// unmetered (with a warning outside dev mode).
fn build_credit_gate(config: &AppConfig) -> Arc<dyn CreditGate> {
    match std::env::var("PIXELQUEUE_CREDIT_URL") {
        Ok(url) if !url.is_empty() => {
            info!(url = %url, "Using HTTP credit gate");
            Arc::new(HttpCreditGate::new(url))
        }
        _ => {
            if !config.dev_mode {
                warn!("No credit service configured - admitting all users unmetered");
            }
            Arc::new(UnmeteredCreditGate)
        }
    }
}

/// Credit gate backed by the billing service's HTTP API.
///
/// `GET {base}/{user_id}` is expected to answer `{"hasCredit": bool}`.
/// Lookup failures admit the request: billing outages must not take
/// submissions down with them.
struct HttpCreditGate {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCreditGate {
    fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");
        Self { client, base_url }
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreditResponse {
    has_credit: bool,
}

#[async_trait]
impl CreditGate for HttpCreditGate {
    async fn check_credit(&self, user_id: &str) -> bool {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), user_id);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<CreditResponse>().await {
                    Ok(body) => body.has_credit,
                    Err(e) => {
                        warn!(error = %e, "Malformed credit response - admitting");
                        true
                    }
                }
            }
            Ok(response) => {
                warn!(status = %response.status(), "Credit service error - admitting");
                true
            }
            Err(e) => {
                warn!(error = %e, "Credit service unreachable - admitting");
                true
            }
        }
    }
}

/// Built-in provider for development: returns placeholder image URLs.
struct DevProviderAdapter;

#[async_trait]
impl ProviderAdapter for DevProviderAdapter {
    fn name(&self) -> &str {
        "dev"
    }

    async fn generate(
        &self,
        _prompt: &str,
        _guidance: &GuidanceParams,
    ) -> Result<ImageRef, ProviderError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(ImageRef {
            url: format!("https://placehold.localdomain/{}.png", uuid::Uuid::new_v4()),
            provider: "dev".to_string(),
        })
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
