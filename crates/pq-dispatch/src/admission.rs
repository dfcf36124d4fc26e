//! AdmissionController - gatekeeper for incoming generation submissions
//!
//! Every submission passes validation, a capacity check, duplicate
//! suppression, and an external credit check before it may enter the queue.
//! The credit check is awaited without any internal lock held; the capacity
//! bound is enforced again atomically inside `RequestQueue::enqueue`, so the
//! pre-check here is only a cheap fast path.
//!
//! Admission verdicts are synchronous: the caller gets either the new
//! request id or a typed rejection, and never waits on provider latency.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pq_common::{GenerationSubmission, QueuedRequest};

use crate::breaker::CircuitState;
use crate::dispatcher::ProviderDispatcher;
use crate::error::DispatchError;
use crate::metrics;
use crate::queue::RequestQueue;

/// External credit ledger gate, supplied by the billing system.
#[async_trait]
pub trait CreditGate: Send + Sync {
    /// Whether `user_id` has credit for one more generation.
    async fn check_credit(&self, user_id: &str) -> bool;
}

/// Credit gate that admits everyone. Development and testing only.
pub struct UnmeteredCreditGate;

#[async_trait]
impl CreditGate for UnmeteredCreditGate {
    async fn check_credit(&self, _user_id: &str) -> bool {
        true
    }
}

/// Identity of a submission for duplicate suppression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    user_id: String,
    prompt: String,
    providers: Vec<String>,
}

impl DedupKey {
    fn of(submission: &GenerationSubmission) -> Self {
        Self {
            user_id: submission.user_id.clone(),
            prompt: submission.prompt.clone(),
            providers: submission.providers.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DedupEntry {
    request_id: Uuid,
    accepted_at: Instant,
}

/// Configuration for the admission controller
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Window during which identical resubmissions are suppressed.
    pub dedup_window: Duration,
    /// Maximum accepted prompt length in characters.
    pub max_prompt_chars: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(5),
            max_prompt_chars: 10_000,
        }
    }
}

pub struct AdmissionController {
    queue: Arc<RequestQueue>,
    dispatcher: Arc<ProviderDispatcher>,
    credit: Arc<dyn CreditGate>,
    config: AdmissionConfig,
    recent: DashMap<DedupKey, DedupEntry>,
    open: AtomicBool,
}

impl AdmissionController {
    pub fn new(
        queue: Arc<RequestQueue>,
        dispatcher: Arc<ProviderDispatcher>,
        credit: Arc<dyn CreditGate>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            credit,
            config,
            recent: DashMap::new(),
            open: AtomicBool::new(true),
        }
    }

    /// Stop admitting new submissions (shutdown).
    pub fn close(&self) {
        info!("Admission closed");
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Admit one submission. On success the request is enqueued, the
    /// dispatcher is woken, and the new id is returned before any provider
    /// work happens.
    pub async fn accept(
        &self,
        submission: GenerationSubmission,
    ) -> Result<Uuid, DispatchError> {
        let verdict = self.try_accept(submission).await;
        match &verdict {
            Ok(id) => {
                debug!(request_id = %id, "Submission admitted");
                metrics::record_admitted();
            }
            Err(error) => {
                debug!(reason = error.code(), "Submission rejected");
                metrics::record_rejected(error.code());
            }
        }
        verdict
    }

    async fn try_accept(
        &self,
        submission: GenerationSubmission,
    ) -> Result<Uuid, DispatchError> {
        if !self.is_open() {
            return Err(DispatchError::ShutdownInProgress);
        }

        self.validate(&submission)?;

        // Fast-path capacity check; enqueue re-checks under the lock
        if self.queue.pending_len() >= self.queue.max_depth() {
            return Err(DispatchError::QueueFull);
        }

        // Fail fast when every requested provider is circuit-open
        let all_open = submission.providers.iter().all(|p| {
            matches!(self.dispatcher.circuit_state(p), Some(CircuitState::Open))
        });
        if all_open {
            return Err(DispatchError::ProviderUnavailable(
                submission.providers.join(", "),
            ));
        }

        let key = DedupKey::of(&submission);
        if self.is_duplicate(&key) {
            return Err(DispatchError::DuplicateRequest);
        }

        // External call: no internal lock is held across this await
        if !self.credit.check_credit(&submission.user_id).await {
            warn!(user_id = %submission.user_id, "Submission rejected for insufficient credit");
            return Err(DispatchError::InsufficientCredit);
        }

        let request = QueuedRequest::new(submission);
        let id = self.queue.enqueue(request)?;

        self.recent.insert(
            key,
            DedupEntry {
                request_id: id,
                accepted_at: Instant::now(),
            },
        );

        self.dispatcher.wake();
        metrics::set_queue_depth(self.queue.pending_len());
        Ok(id)
    }

    fn validate(&self, submission: &GenerationSubmission) -> Result<(), DispatchError> {
        if submission.user_id.is_empty() {
            return Err(DispatchError::InvalidRequest("userId is empty".into()));
        }
        if submission.prompt.trim().is_empty() {
            return Err(DispatchError::InvalidRequest("prompt is empty".into()));
        }
        if submission.prompt.chars().count() > self.config.max_prompt_chars {
            return Err(DispatchError::InvalidRequest(format!(
                "prompt exceeds {} characters",
                self.config.max_prompt_chars
            )));
        }
        if submission.providers.is_empty() {
            return Err(DispatchError::InvalidRequest(
                "providers list is empty".into(),
            ));
        }
        for (i, provider) in submission.providers.iter().enumerate() {
            if submission.providers[..i].contains(provider) {
                return Err(DispatchError::InvalidRequest(format!(
                    "duplicate provider: {}",
                    provider
                )));
            }
            if !self.dispatcher.contains_provider(provider) {
                return Err(DispatchError::InvalidRequest(format!(
                    "unknown provider: {}",
                    provider
                )));
            }
        }
        Ok(())
    }

    /// An identical tuple accepted within the window counts as a duplicate
    /// only while the original is still non-terminal.
    fn is_duplicate(&self, key: &DedupKey) -> bool {
        let Some(entry) = self.recent.get(key) else {
            return false;
        };

        if entry.accepted_at.elapsed() > self.config.dedup_window {
            return false;
        }

        match self.queue.get(entry.request_id) {
            Some(original) => !original.is_terminal(),
            None => false,
        }
    }

    /// Drop dedup entries older than the window. Called by the retention
    /// sweep.
    pub fn prune_dedup(&self) {
        let window = self.config.dedup_window;
        self.recent.retain(|_, entry| entry.accepted_at.elapsed() <= window);
    }
}

/// Spawn the background retention sweep: evicts expired terminal requests and
/// prunes the dedup map on an interval, until shutdown.
pub fn spawn_retention_sweep(
    queue: Arc<RequestQueue>,
    admission: Arc<AdmissionController>,
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    queue.sweep_expired(Instant::now());
                    admission.prune_dedup();
                    metrics::set_queue_depth(queue.pending_len());
                }
                _ = shutdown_rx.recv() => {
                    info!("Retention sweep shutting down");
                    break;
                }
            }
        }
    })
}
