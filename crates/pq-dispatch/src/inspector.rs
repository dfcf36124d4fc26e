//! QueueInspector - read-only snapshot and admin mutation surface
//!
//! The snapshot copies queue state under one short lock hold and computes
//! everything else outside it, so operator introspection never blocks the
//! dispatch workers. Authorization and audit logging of the admin mutations
//! are the caller's job.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use uuid::Uuid;

use pq_common::{PendingRequest, QueueHealth, QueueSnapshot, QueuedRequest, RequestStatus};

use crate::dispatcher::ProviderDispatcher;
use crate::error::DispatchError;
use crate::health::HealthMonitor;
use crate::metrics;
use crate::queue::RequestQueue;

pub struct QueueInspector {
    queue: Arc<RequestQueue>,
    dispatcher: Arc<ProviderDispatcher>,
    monitor: HealthMonitor,
}

impl QueueInspector {
    pub fn new(
        queue: Arc<RequestQueue>,
        dispatcher: Arc<ProviderDispatcher>,
        monitor: HealthMonitor,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            monitor,
        }
    }

    /// Point-in-time projection of the queue. O(n), read-only.
    pub fn snapshot(&self) -> QueueSnapshot {
        let now = Instant::now();
        let all = self.queue.all();

        let pending: Vec<&QueuedRequest> =
            all.iter().filter(|r| r.status.is_pending()).collect();
        let length = pending.len();
        let is_processing = pending
            .iter()
            .any(|r| r.status == RequestStatus::Dispatched);
        let oldest_age = pending
            .iter()
            .map(|r| now.saturating_duration_since(r.enqueued_at))
            .max();

        let referenced: HashSet<String> = pending
            .iter()
            .flat_map(|r| r.providers.iter().cloned())
            .collect();
        let provider_stats = self.dispatcher.provider_stats();
        let health = self
            .monitor
            .evaluate(length, oldest_age, &provider_stats, &referenced);

        QueueSnapshot {
            length,
            is_processing,
            oldest_request_age_ms: oldest_age.map(|d| d.as_millis() as u64).unwrap_or(0),
            pending_requests: pending.into_iter().map(PendingRequest::from).collect(),
            health,
        }
    }

    /// Health verdict only, for probes.
    pub fn health(&self) -> QueueHealth {
        self.snapshot().health
    }

    /// Cancel every pending (Queued/Retrying) request. Dispatched requests
    /// finish normally and keep counting toward the queue length until they
    /// do. Returns the number of cancelled requests.
    pub fn clear(&self) -> usize {
        let cleared = self.queue.clear_pending();
        metrics::record_cleared(cleared);
        metrics::set_queue_depth(self.queue.pending_len());
        info!(cleared = cleared, "Admin cleared the queue");
        cleared
    }

    /// Cancel one pending request; explicit error if it is already
    /// dispatched, terminal, or unknown.
    pub fn remove(&self, id: Uuid) -> Result<(), DispatchError> {
        self.queue.cancel(id)?;
        metrics::set_queue_depth(self.queue.pending_len());
        info!(request_id = %id, "Admin removed request");
        Ok(())
    }

    /// Look up one request, pending or retained-terminal.
    pub fn get(&self, id: Uuid) -> Option<QueuedRequest> {
        self.queue.get(id)
    }
}
