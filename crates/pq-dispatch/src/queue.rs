//! RequestQueue - single point of truth for queued generation requests
//!
//! All mutations go through one mutex-owned map, so no caller ever observes a
//! half-updated state. Requests stay in the map from admission until a
//! retention sweep evicts them, which keeps insertion order stable: a request
//! re-entering eligibility after a retry keeps its original position and
//! cannot be starved by newer work.

use crate::error::DispatchError;
use indexmap::IndexMap;
use parking_lot::Mutex;
use pq_common::{ImageRef, QueuedRequest, RequestStatus};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

pub struct RequestQueue {
    state: Mutex<IndexMap<Uuid, QueuedRequest>>,
    max_depth: usize,
    retention_ttl: Duration,
}

impl RequestQueue {
    pub fn new(max_depth: usize, retention_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(IndexMap::new()),
            max_depth,
            retention_ttl,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Admit a request into the queue. The capacity bound is enforced here,
    /// under the lock, so it holds exactly even under concurrent admission.
    pub fn enqueue(&self, request: QueuedRequest) -> Result<Uuid, DispatchError> {
        let mut state = self.state.lock();
        let pending = state.values().filter(|r| r.status.is_pending()).count();
        if pending >= self.max_depth {
            return Err(DispatchError::QueueFull);
        }

        let id = request.id;
        debug!(request_id = %id, user_id = %request.user_id, "Request enqueued");
        state.insert(id, request);
        Ok(id)
    }

    /// Claim the oldest request eligible for `provider`: status `Queued`, or
    /// `Retrying` with its backoff elapsed. The claim is atomic: status moves
    /// to `Dispatched` and the attempt counter increments under the lock.
    pub fn claim_next_for(&self, provider: &str, now: Instant) -> Option<QueuedRequest> {
        let mut state = self.state.lock();
        let request = state.values_mut().find(|r| is_ready_for(r, provider, now))?;

        request.status = RequestStatus::Dispatched;
        request.attempts += 1;
        request.next_attempt_at = None;
        Some(request.clone())
    }

    /// Whether any request is currently eligible for `provider`.
    pub fn has_ready_for(&self, provider: &str, now: Instant) -> bool {
        let state = self.state.lock();
        state.values().any(|r| is_ready_for(r, provider, now))
    }

    /// Apply a status transition. Writes against a terminal request are
    /// ignored (returns false) - this is what discards the result of an
    /// in-flight call whose request was cancelled meanwhile.
    pub fn update_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        error: Option<String>,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(request) = state.get_mut(&id) else {
            return false;
        };
        if request.status.is_terminal() {
            return false;
        }

        request.status = status;
        if let Some(error) = error {
            request.last_error = Some(error);
        }
        if status.is_terminal() {
            request.finished_at = Some(Instant::now());
            request.next_attempt_at = None;
        }
        true
    }

    /// Terminal success: store the result and mark `Completed`.
    pub fn complete(&self, id: Uuid, image: ImageRef) -> bool {
        let mut state = self.state.lock();
        let Some(request) = state.get_mut(&id) else {
            return false;
        };
        if request.status.is_terminal() {
            return false;
        }

        request.status = RequestStatus::Completed;
        request.image = Some(image);
        request.finished_at = Some(Instant::now());
        request.next_attempt_at = None;
        true
    }

    /// Terminal failure.
    pub fn fail(&self, id: Uuid, error: impl Into<String>) -> bool {
        self.update_status(id, RequestStatus::Failed, Some(error.into()))
    }

    /// Schedule a retry: the request becomes eligible again once
    /// `next_attempt_at` passes, at its original queue position.
    pub fn mark_retrying(
        &self,
        id: Uuid,
        error: impl Into<String>,
        next_attempt_at: Instant,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(request) = state.get_mut(&id) else {
            return false;
        };
        if request.status.is_terminal() {
            return false;
        }

        request.status = RequestStatus::Retrying;
        request.last_error = Some(error.into());
        request.next_attempt_at = Some(next_attempt_at);
        true
    }

    /// Cancel one pending request. Already-dispatched and terminal requests
    /// are left alone with an explicit error.
    pub fn cancel(&self, id: Uuid) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        let Some(request) = state.get_mut(&id) else {
            return Err(DispatchError::RequestNotFound(id));
        };

        match request.status {
            RequestStatus::Queued | RequestStatus::Retrying => {
                request.status = RequestStatus::Cancelled;
                request.finished_at = Some(Instant::now());
                request.next_attempt_at = None;
                info!(request_id = %id, "Request cancelled");
                Ok(())
            }
            _ => Err(DispatchError::RequestNotPending(id)),
        }
    }

    /// Cancel every `Queued`/`Retrying` request. Dispatched requests keep
    /// running; their in-flight calls finish normally.
    pub fn clear_pending(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let mut cleared = 0;

        for request in state.values_mut() {
            if matches!(
                request.status,
                RequestStatus::Queued | RequestStatus::Retrying
            ) {
                request.status = RequestStatus::Cancelled;
                request.finished_at = Some(now);
                request.next_attempt_at = None;
                cleared += 1;
            }
        }

        info!(cleared = cleared, "Queue cleared");
        cleared
    }

    pub fn get(&self, id: Uuid) -> Option<QueuedRequest> {
        self.state.lock().get(&id).cloned()
    }

    /// Copy of every retained request, in submission order.
    pub fn all(&self) -> Vec<QueuedRequest> {
        self.state.lock().values().cloned().collect()
    }

    /// Count of requests with status in {Queued, Dispatched, Retrying}.
    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .values()
            .filter(|r| r.status.is_pending())
            .count()
    }

    /// True iff at least one request is currently dispatched to a provider.
    pub fn is_processing(&self) -> bool {
        self.state
            .lock()
            .values()
            .any(|r| r.status == RequestStatus::Dispatched)
    }

    /// Age of the oldest pending request.
    pub fn oldest_pending_age(&self, now: Instant) -> Option<Duration> {
        self.state
            .lock()
            .values()
            .filter(|r| r.status.is_pending())
            .map(|r| now.saturating_duration_since(r.enqueued_at))
            .max()
    }

    /// Evict terminal requests older than the retention TTL. Returns the
    /// number of evicted entries.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let before = state.len();
        let ttl = self.retention_ttl;
        state.retain(|_, r| match r.finished_at {
            Some(finished_at) => now.saturating_duration_since(finished_at) < ttl,
            None => true,
        });
        let evicted = before - state.len();
        if evicted > 0 {
            debug!(evicted = evicted, "Evicted expired terminal requests");
        }
        evicted
    }
}

fn is_ready_for(request: &QueuedRequest, provider: &str, now: Instant) -> bool {
    if !request.providers.iter().any(|p| p == provider) {
        return false;
    }
    match request.status {
        RequestStatus::Queued => true,
        RequestStatus::Retrying => request
            .next_attempt_at
            .map(|at| at <= now)
            .unwrap_or(true),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pq_common::{GenerationSubmission, GuidanceParams};

    fn submission(prompt: &str, providers: &[&str]) -> GenerationSubmission {
        GenerationSubmission {
            user_id: "user-1".to_string(),
            prompt: prompt.to_string(),
            providers: providers.iter().map(|s| s.to_string()).collect(),
            guidance: GuidanceParams::default(),
        }
    }

    fn queue() -> RequestQueue {
        RequestQueue::new(10, Duration::from_secs(60))
    }

    #[test]
    fn enqueue_rejects_at_capacity() {
        let queue = RequestQueue::new(2, Duration::from_secs(60));
        queue
            .enqueue(QueuedRequest::new(submission("a", &["flux"])))
            .unwrap();
        queue
            .enqueue(QueuedRequest::new(submission("b", &["flux"])))
            .unwrap();

        let err = queue
            .enqueue(QueuedRequest::new(submission("c", &["flux"])))
            .unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull));
    }

    #[test]
    fn terminal_entries_free_capacity() {
        let queue = RequestQueue::new(1, Duration::from_secs(60));
        let id = queue
            .enqueue(QueuedRequest::new(submission("a", &["flux"])))
            .unwrap();
        assert!(queue
            .enqueue(QueuedRequest::new(submission("b", &["flux"])))
            .is_err());

        queue.cancel(id).unwrap();
        assert!(queue
            .enqueue(QueuedRequest::new(submission("b", &["flux"])))
            .is_ok());
    }

    #[test]
    fn claim_is_fifo_per_provider() {
        let queue = queue();
        let first = queue
            .enqueue(QueuedRequest::new(submission("a", &["flux"])))
            .unwrap();
        let second = queue
            .enqueue(QueuedRequest::new(submission("b", &["flux"])))
            .unwrap();

        let now = Instant::now();
        let claimed = queue.claim_next_for("flux", now).unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, RequestStatus::Dispatched);
        assert_eq!(claimed.attempts, 1);

        let claimed = queue.claim_next_for("flux", now).unwrap();
        assert_eq!(claimed.id, second);
        assert!(queue.claim_next_for("flux", now).is_none());
    }

    #[test]
    fn saturated_provider_does_not_block_others() {
        let queue = queue();
        queue
            .enqueue(QueuedRequest::new(submission("a", &["flux"])))
            .unwrap();
        let other = queue
            .enqueue(QueuedRequest::new(submission("b", &["dalle"])))
            .unwrap();

        // "dalle" worker skips the flux-only request at the head
        let claimed = queue.claim_next_for("dalle", Instant::now()).unwrap();
        assert_eq!(claimed.id, other);
    }

    #[test]
    fn retrying_request_waits_for_backoff() {
        let queue = queue();
        let id = queue
            .enqueue(QueuedRequest::new(submission("a", &["flux"])))
            .unwrap();

        let now = Instant::now();
        queue.claim_next_for("flux", now).unwrap();
        queue.mark_retrying(id, "server error", now + Duration::from_millis(100));

        assert!(queue.claim_next_for("flux", now).is_none());
        let later = now + Duration::from_millis(150);
        let claimed = queue.claim_next_for("flux", later).unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.attempts, 2);
    }

    #[test]
    fn retry_keeps_original_position() {
        let queue = queue();
        let first = queue
            .enqueue(QueuedRequest::new(submission("a", &["flux"])))
            .unwrap();
        let second = queue
            .enqueue(QueuedRequest::new(submission("b", &["flux"])))
            .unwrap();

        let now = Instant::now();
        assert_eq!(queue.claim_next_for("flux", now).unwrap().id, first);
        // First request fails and becomes ready again immediately
        queue.mark_retrying(first, "server error", now);

        // It wins over the younger queued request
        assert_eq!(queue.claim_next_for("flux", now).unwrap().id, first);
        assert_eq!(queue.claim_next_for("flux", now).unwrap().id, second);
    }

    #[test]
    fn terminal_writes_are_ignored() {
        let queue = queue();
        let id = queue
            .enqueue(QueuedRequest::new(submission("a", &["flux"])))
            .unwrap();
        queue.cancel(id).unwrap();

        // Late terminal write from an in-flight call is discarded
        assert!(!queue.fail(id, "server error"));
        assert!(!queue.complete(
            id,
            ImageRef {
                url: "https://img.example.com/1.png".into(),
                provider: "flux".into()
            }
        ));
        assert_eq!(queue.get(id).unwrap().status, RequestStatus::Cancelled);
        assert!(queue.get(id).unwrap().image.is_none());
    }

    #[test]
    fn cancel_errors_on_dispatched_and_unknown() {
        let queue = queue();
        let id = queue
            .enqueue(QueuedRequest::new(submission("a", &["flux"])))
            .unwrap();
        queue.claim_next_for("flux", Instant::now()).unwrap();

        assert!(matches!(
            queue.cancel(id),
            Err(DispatchError::RequestNotPending(_))
        ));
        assert!(matches!(
            queue.cancel(Uuid::new_v4()),
            Err(DispatchError::RequestNotFound(_))
        ));
    }

    #[test]
    fn clear_skips_dispatched() {
        let queue = queue();
        let queued = queue
            .enqueue(QueuedRequest::new(submission("a", &["flux"])))
            .unwrap();
        let dispatched = queue
            .enqueue(QueuedRequest::new(submission("b", &["flux"])))
            .unwrap();
        // Claim the older one first
        assert_eq!(
            queue.claim_next_for("flux", Instant::now()).unwrap().id,
            queued
        );

        let cleared = queue.clear_pending();
        assert_eq!(cleared, 1);
        assert_eq!(
            queue.get(dispatched).unwrap().status,
            RequestStatus::Cancelled
        );
        assert_eq!(queue.get(queued).unwrap().status, RequestStatus::Dispatched);
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn sweep_evicts_only_expired_terminal_entries() {
        let queue = RequestQueue::new(10, Duration::from_millis(50));
        let done = queue
            .enqueue(QueuedRequest::new(submission("a", &["flux"])))
            .unwrap();
        let live = queue
            .enqueue(QueuedRequest::new(submission("b", &["flux"])))
            .unwrap();
        queue.cancel(done).unwrap();

        // Not yet expired
        assert_eq!(queue.sweep_expired(Instant::now()), 0);

        let later = Instant::now() + Duration::from_millis(100);
        assert_eq!(queue.sweep_expired(later), 1);
        assert!(queue.get(done).is_none());
        assert!(queue.get(live).is_some());
    }

    #[test]
    fn oldest_age_is_none_when_empty() {
        let queue = queue();
        assert!(queue.oldest_pending_age(Instant::now()).is_none());

        let id = queue
            .enqueue(QueuedRequest::new(submission("a", &["flux"])))
            .unwrap();
        assert!(queue.oldest_pending_age(Instant::now()).is_some());

        queue.cancel(id).unwrap();
        assert!(queue.oldest_pending_age(Instant::now()).is_none());
    }
}
