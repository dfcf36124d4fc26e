//! Completion hooks - events consumed by the surrounding system
//!
//! Image storage, notification, and billing settlement subscribe to terminal
//! request states through this trait. The queue does not know what the
//! subscribers do with them.

use async_trait::async_trait;
use pq_common::QueuedRequest;

/// Callbacks fired when a request reaches a terminal state.
#[async_trait]
pub trait CompletionHooks: Send + Sync {
    /// Fired once when a request completes with an image.
    async fn on_completed(&self, request: &QueuedRequest);

    /// Fired once when a request fails terminally (fatal error, retry budget
    /// exhausted, or internal fault). Not fired for cancellations.
    async fn on_failed(&self, request: &QueuedRequest);
}

/// No-op hooks for when nothing downstream is wired up.
pub struct NoOpHooks;

#[async_trait]
impl CompletionHooks for NoOpHooks {
    async fn on_completed(&self, _request: &QueuedRequest) {}
    async fn on_failed(&self, _request: &QueuedRequest) {}
}
