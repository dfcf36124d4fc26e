//! PixelQueue Generation Dispatch Queue
//!
//! This crate provides the admission and dispatch core with:
//! - RequestQueue: single point of truth for queued generation requests
//! - AdmissionController: backpressure, duplicate suppression, credit gating
//! - ProviderDispatcher: per-provider worker loops with concurrency budgets
//! - RetryCoordinator: failure classification and backoff scheduling
//! - CircuitBreaker: per-provider guard against failing upstreams
//! - HealthMonitor: healthy/warning/critical verdicts with issue strings
//! - QueueInspector: read-only snapshots and admin mutations
//! - ProviderAdapter: uniform capability interface over external image APIs
//! - API: HTTP endpoints for submission, monitoring, and admin actions

pub mod admission;
pub mod api;
pub mod breaker;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod health;
pub mod inspector;
pub mod metrics;
pub mod provider;
pub mod queue;
pub mod retry;

pub use admission::{
    spawn_retention_sweep, AdmissionConfig, AdmissionController, CreditGate, UnmeteredCreditGate,
};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use dispatcher::{ProviderDispatcher, ProviderRuntime, ProviderStats};
pub use error::DispatchError;
pub use events::{CompletionHooks, NoOpHooks};
pub use health::{HealthMonitor, HealthThresholds};
pub use inspector::QueueInspector;
pub use provider::{HttpProviderAdapter, HttpProviderConfig, ProviderAdapter, ProviderError};
pub use queue::RequestQueue;
pub use retry::{FailureClass, RetryCoordinator, RetryPolicy};

pub type Result<T> = std::result::Result<T, DispatchError>;
