//! ProviderDispatcher - per-provider worker loops with concurrency budgets
//!
//! One worker loop per configured provider. Each loop acquires a semaphore
//! permit sized to the provider's budget, claims the oldest eligible request
//! from the queue, and spawns the actual provider call so the loop can keep
//! feeding the provider up to its limit. The circuit breaker and optional
//! rate limiter gate the loop before a claim happens, so no request is marked
//! dispatched while the provider is known to be unavailable.
//!
//! No queue lock is ever held across an await point: claims, status writes,
//! and counter updates are short synchronous critical sections.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use pq_common::ImageRef;

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::events::CompletionHooks;
use crate::metrics;
use crate::provider::{ProviderAdapter, ProviderError};
use crate::queue::RequestQueue;
use crate::retry::RetryCoordinator;

/// Fallback poll interval while idle; a lost wakeup costs at most this long.
const IDLE_POLL: Duration = Duration::from_millis(250);
/// Re-check interval while waiting on an open circuit or a rate limit.
const GATE_RECHECK: Duration = Duration::from_millis(100);

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Runtime configuration for one provider's dispatch loop.
pub struct ProviderRuntime {
    pub name: String,
    pub adapter: Arc<dyn ProviderAdapter>,
    /// Max concurrent in-flight dispatches.
    pub limit: u32,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Optional requests-per-minute cap.
    pub rate_limit_per_minute: Option<u32>,
}

/// Observable state of one provider budget.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStats {
    pub name: String,
    pub limit: u32,
    pub in_flight: u32,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub rate_limit_per_minute: Option<u32>,
}

/// Per-provider dispatch state shared between the loop and its tasks.
struct ProviderHandle {
    name: Arc<str>,
    adapter: Arc<dyn ProviderAdapter>,
    limit: u32,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicU32,
    breaker: CircuitBreaker,
    rate_limiter: Option<DirectRateLimiter>,
    rate_limit_per_minute: Option<u32>,
}

impl ProviderHandle {
    fn stats(&self) -> ProviderStats {
        ProviderStats {
            name: self.name.to_string(),
            limit: self.limit,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            circuit_state: self.breaker.state(),
            consecutive_failures: self.breaker.consecutive_failures(),
            rate_limit_per_minute: self.rate_limit_per_minute,
        }
    }
}

pub struct ProviderDispatcher {
    queue: Arc<RequestQueue>,
    retry: Arc<RetryCoordinator>,
    hooks: Arc<dyn CompletionHooks>,
    providers: HashMap<String, Arc<ProviderHandle>>,
    work_notify: Arc<Notify>,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProviderDispatcher {
    pub fn new(
        queue: Arc<RequestQueue>,
        retry: Arc<RetryCoordinator>,
        hooks: Arc<dyn CompletionHooks>,
        providers: Vec<ProviderRuntime>,
        breaker_config: BreakerConfig,
        work_notify: Arc<Notify>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        let providers = providers
            .into_iter()
            .map(|p| {
                let rate_limiter = p
                    .rate_limit_per_minute
                    .and_then(NonZeroU32::new)
                    .map(|rpm| RateLimiter::direct(Quota::per_minute(rpm)));

                let handle = Arc::new(ProviderHandle {
                    name: Arc::from(p.name.as_str()),
                    adapter: p.adapter,
                    limit: p.limit,
                    timeout: p.timeout,
                    semaphore: Arc::new(Semaphore::new(p.limit as usize)),
                    in_flight: AtomicU32::new(0),
                    breaker: CircuitBreaker::new(breaker_config.clone()),
                    rate_limiter,
                    rate_limit_per_minute: p.rate_limit_per_minute,
                });
                (p.name, handle)
            })
            .collect();

        Self {
            queue,
            retry,
            hooks,
            providers,
            work_notify,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Spawn one worker loop per provider.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // Already running
        }

        for handle in self.providers.values() {
            info!(
                provider = %handle.name,
                limit = handle.limit,
                rate_limit = ?handle.rate_limit_per_minute,
                "Starting provider worker"
            );
            let dispatcher = Arc::clone(self);
            let handle = Arc::clone(handle);
            tokio::spawn(async move {
                dispatcher.run_provider_worker(handle).await;
            });
        }
    }

    /// Wake idle workers: new work was enqueued or a backoff elapsed.
    pub fn wake(&self) {
        self.work_notify.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn contains_provider(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn circuit_state(&self, name: &str) -> Option<CircuitState> {
        self.providers.get(name).map(|h| h.breaker.state())
    }

    /// Force a provider's circuit closed (operator action).
    pub fn reset_circuit(&self, name: &str) -> bool {
        match self.providers.get(name) {
            Some(handle) => {
                handle.breaker.reset();
                self.wake();
                true
            }
            None => false,
        }
    }

    pub fn provider_stats(&self) -> Vec<ProviderStats> {
        let mut stats: Vec<ProviderStats> =
            self.providers.values().map(|h| h.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn total_in_flight(&self) -> u32 {
        self.providers
            .values()
            .map(|h| h.in_flight.load(Ordering::SeqCst))
            .sum()
    }

    /// Stop the workers and wait for in-flight dispatches to drain. In-flight
    /// provider calls are never interrupted; they finish or hit their own
    /// timeout.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        info!("Shutting down dispatcher");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        self.work_notify.notify_waiters();

        let deadline = Instant::now() + drain_timeout;
        while self.total_in_flight() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    in_flight = self.total_in_flight(),
                    "Drain timeout reached with dispatches still in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("Dispatcher stopped");
    }

    /// Worker loop for one provider.
    async fn run_provider_worker(self: Arc<Self>, handle: Arc<ProviderHandle>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(provider = %handle.name, "Provider worker started");

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            // One permit = one in-flight slot. Acquiring before the claim is
            // what makes the budget invariant hold under any burst.
            let permit = tokio::select! {
                permit = handle.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.recv() => break,
            };

            // Circuit gate: park while open, re-check after the cooldown
            if !handle.breaker.allow_request() {
                drop(permit);
                let pause = handle
                    .breaker
                    .cooldown_remaining()
                    .unwrap_or(GATE_RECHECK)
                    .min(GATE_RECHECK)
                    .max(Duration::from_millis(10));
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown_rx.recv() => break,
                }
                continue;
            }

            // Register for wakeups before checking, so an enqueue between the
            // check and the await still lands.
            let wakeup = self.work_notify.notified();
            tokio::pin!(wakeup);

            if !self.queue.has_ready_for(&handle.name, Instant::now()) {
                drop(permit);
                tokio::select! {
                    _ = &mut wakeup => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                    _ = shutdown_rx.recv() => break,
                }
                continue;
            }

            // Rate-limit gate, after we know there is work to claim
            if !Self::wait_for_rate_permit(&handle, &mut shutdown_rx).await {
                drop(permit);
                break;
            }

            let Some(request) = self.queue.claim_next_for(&handle.name, Instant::now()) else {
                // Another worker claimed it first
                drop(permit);
                continue;
            };

            let in_flight = handle.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::set_in_flight(&handle.name, in_flight);
            metrics::set_queue_depth(self.queue.pending_len());

            let dispatcher = Arc::clone(&self);
            let handle_clone = Arc::clone(&handle);
            tokio::spawn(async move {
                dispatcher.dispatch_one(handle_clone, request, permit).await;
            });
        }

        info!(provider = %handle.name, "Provider worker exited");
    }

    /// Wait until the provider's rate limiter yields a permit. Returns false
    /// on shutdown.
    async fn wait_for_rate_permit(
        handle: &ProviderHandle,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        let Some(ref limiter) = handle.rate_limiter else {
            return true;
        };

        let mut recorded = false;
        loop {
            if limiter.check().is_ok() {
                return true;
            }
            // Record the stall once per wait, not per poll
            if !recorded {
                metrics::record_rate_limited(&handle.name);
                debug!(provider = %handle.name, "Rate limited - waiting for permit");
                recorded = true;
            }
            tokio::select! {
                _ = tokio::time::sleep(GATE_RECHECK) => {}
                _ = shutdown_rx.recv() => return false,
            }
        }
    }

    /// Run one provider call to completion and route the outcome.
    async fn dispatch_one(
        &self,
        handle: Arc<ProviderHandle>,
        request: pq_common::QueuedRequest,
        permit: OwnedSemaphorePermit,
    ) {
        let start = Instant::now();
        debug!(
            request_id = %request.id,
            provider = %handle.name,
            attempt = request.attempts,
            "Dispatching request"
        );

        // catch_unwind contains a panicking adapter: the request fails
        // defensively and the counters below still unwind.
        let call = std::panic::AssertUnwindSafe(tokio::time::timeout(
            handle.timeout,
            handle.adapter.generate(&request.prompt, &request.guidance),
        ))
        .catch_unwind()
        .await;

        let outcome = match call {
            Ok(Ok(Ok(image))) => CallOutcome::Success(image),
            Ok(Ok(Err(error))) => CallOutcome::Failure(error),
            Ok(Err(_elapsed)) => CallOutcome::Failure(ProviderError::Timeout(handle.timeout)),
            Err(_panic) => CallOutcome::Panicked,
        };

        let duration = start.elapsed();
        match outcome {
            CallOutcome::Success(image) => {
                handle.breaker.record_success();
                metrics::record_dispatch(&handle.name, true, duration);

                if self.queue.complete(request.id, image) {
                    info!(
                        request_id = %request.id,
                        provider = %handle.name,
                        attempts = request.attempts,
                        duration_ms = duration.as_millis() as u64,
                        "Generation completed"
                    );
                    if let Some(done) = self.queue.get(request.id) {
                        self.hooks.on_completed(&done).await;
                    }
                } else {
                    // Cancelled while in flight; the result is discarded
                    debug!(
                        request_id = %request.id,
                        "Result discarded, request already terminal"
                    );
                }
            }
            CallOutcome::Failure(error) => {
                // Rate limiting is backpressure, not a provider failure
                match &error {
                    ProviderError::RateLimited { .. } => handle.breaker.record_success(),
                    _ => handle.breaker.record_failure(),
                }
                metrics::record_dispatch(&handle.name, false, duration);
                warn!(
                    request_id = %request.id,
                    provider = %handle.name,
                    attempt = request.attempts,
                    error = %error,
                    "Provider call failed"
                );

                let failed_terminally =
                    self.retry
                        .handle_failure(request.id, &handle.name, request.attempts, &error);
                if failed_terminally {
                    if let Some(done) = self.queue.get(request.id) {
                        self.hooks.on_failed(&done).await;
                    }
                }
            }
            CallOutcome::Panicked => {
                handle.breaker.record_failure();
                metrics::record_dispatch(&handle.name, false, duration);
                error!(
                    request_id = %request.id,
                    provider = %handle.name,
                    "Provider adapter panicked"
                );

                if self
                    .queue
                    .fail(request.id, "internal fault: provider adapter panicked")
                {
                    if let Some(done) = self.queue.get(request.id) {
                        self.hooks.on_failed(&done).await;
                    }
                }
            }
        }

        let in_flight = handle.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_in_flight(&handle.name, in_flight);
        drop(permit);

        // A slot freed up; idle workers may have eligible work now
        self.work_notify.notify_waiters();
    }
}

enum CallOutcome {
    Success(ImageRef),
    Failure(ProviderError),
    Panicked,
}
