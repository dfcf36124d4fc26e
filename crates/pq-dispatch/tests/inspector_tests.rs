//! QueueInspector Integration Tests
//!
//! Tests for:
//! - Snapshot length/processing/age accounting
//! - Admin clear semantics with in-flight dispatches
//! - Admin remove semantics
//! - Health surfacing through the snapshot

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use pq_common::{GenerationSubmission, GuidanceParams, ImageRef, RequestStatus};
use pq_dispatch::{
    AdmissionConfig, AdmissionController, BreakerConfig, DispatchError, HealthMonitor,
    HealthThresholds, NoOpHooks, ProviderAdapter, ProviderDispatcher, ProviderError,
    ProviderRuntime, QueueInspector, RequestQueue, RetryCoordinator, RetryPolicy,
    UnmeteredCreditGate,
};

struct GatedAdapter {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl ProviderAdapter for GatedAdapter {
    fn name(&self) -> &str {
        "flux"
    }

    async fn generate(
        &self,
        _prompt: &str,
        _guidance: &GuidanceParams,
    ) -> Result<ImageRef, ProviderError> {
        self.gate.acquire().await.unwrap().forget();
        Ok(ImageRef {
            url: "https://img.example.com/1.png".to_string(),
            provider: "flux".to_string(),
        })
    }
}

struct TestStack {
    queue: Arc<RequestQueue>,
    admission: Arc<AdmissionController>,
    inspector: Arc<QueueInspector>,
    gate: Arc<Semaphore>,
}

fn build_stack(max_depth: usize, limit: u32) -> TestStack {
    let notify = Arc::new(Notify::new());
    let queue = Arc::new(RequestQueue::new(max_depth, Duration::from_secs(60)));
    let retry = Arc::new(RetryCoordinator::new(
        queue.clone(),
        RetryPolicy::default(),
        notify.clone(),
    ));

    let gate = Arc::new(Semaphore::new(0));
    let providers = vec![ProviderRuntime {
        name: "flux".to_string(),
        adapter: Arc::new(GatedAdapter { gate: gate.clone() }),
        limit,
        timeout: Duration::from_secs(5),
        rate_limit_per_minute: None,
    }];

    let dispatcher = Arc::new(ProviderDispatcher::new(
        queue.clone(),
        retry,
        Arc::new(NoOpHooks),
        providers,
        BreakerConfig::default(),
        notify,
    ));
    dispatcher.start();

    let admission = Arc::new(AdmissionController::new(
        queue.clone(),
        dispatcher.clone(),
        Arc::new(UnmeteredCreditGate),
        AdmissionConfig::default(),
    ));
    let inspector = Arc::new(QueueInspector::new(
        queue.clone(),
        dispatcher,
        HealthMonitor::new(HealthThresholds {
            max_queue_depth: max_depth,
            warn_threshold: (max_depth * 3 / 4).max(1),
            age_warn_threshold: Duration::from_secs(60),
        }),
    ));

    TestStack {
        queue,
        admission,
        inspector,
        gate,
    }
}

fn submission(prompt: &str) -> GenerationSubmission {
    GenerationSubmission {
        user_id: "user-1".to_string(),
        prompt: prompt.to_string(),
        providers: vec!["flux".to_string()],
        guidance: GuidanceParams::default(),
    }
}

async fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn empty_queue_snapshot() {
    let stack = build_stack(10, 2);

    let snapshot = stack.inspector.snapshot();
    assert_eq!(snapshot.length, 0);
    assert!(!snapshot.is_processing);
    assert_eq!(snapshot.oldest_request_age_ms, 0);
    assert!(snapshot.pending_requests.is_empty());
}

#[tokio::test]
async fn snapshot_length_counts_only_pending_statuses() {
    let stack = build_stack(10, 2);

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(
            stack
                .admission
                .accept(submission(&format!("prompt {}", i)))
                .await
                .unwrap(),
        );
    }

    // 2 dispatched (budget), 2 queued - all four count
    let queue = stack.queue.clone();
    assert!(
        wait_for(
            || queue.is_processing(),
            Duration::from_secs(5)
        )
        .await
    );
    let snapshot = stack.inspector.snapshot();
    assert_eq!(snapshot.length, 4);
    assert!(snapshot.is_processing);

    // Complete everything; terminal requests stop counting but stay visible
    stack.gate.add_permits(8);
    let queue = stack.queue.clone();
    assert!(
        wait_for(
            || {
                queue
                    .all()
                    .iter()
                    .all(|r| r.status == RequestStatus::Completed)
            },
            Duration::from_secs(5)
        )
        .await
    );

    let snapshot = stack.inspector.snapshot();
    assert_eq!(snapshot.length, 0);
    assert!(!snapshot.is_processing);
    assert_eq!(snapshot.oldest_request_age_ms, 0);
    // Retained for audit until the sweep evicts them
    assert!(stack.queue.get(ids[0]).is_some());
}

#[tokio::test]
async fn oldest_age_tracks_the_oldest_pending_request() {
    let stack = build_stack(10, 1);

    stack.admission.accept(submission("first")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    stack.admission.accept(submission("second")).await.unwrap();

    let snapshot = stack.inspector.snapshot();
    assert!(snapshot.oldest_request_age_ms >= 80);

    // Age never decreases while the request stays pending
    let earlier = snapshot.oldest_request_age_ms;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(stack.inspector.snapshot().oldest_request_age_ms >= earlier);
}

#[tokio::test]
async fn clear_cancels_pending_but_not_in_flight() {
    let stack = build_stack(20, 2);

    let mut ids = Vec::new();
    for i in 0..7 {
        ids.push(
            stack
                .admission
                .accept(submission(&format!("prompt {}", i)))
                .await
                .unwrap(),
        );
    }

    // Two in flight, five waiting
    let queue = stack.queue.clone();
    assert!(
        wait_for(
            || {
                queue
                    .all()
                    .iter()
                    .filter(|r| r.status == RequestStatus::Dispatched)
                    .count()
                    == 2
            },
            Duration::from_secs(5)
        )
        .await
    );

    let cleared = stack.inspector.clear();
    assert_eq!(cleared, 5);

    // In-flight dispatches still count toward the queue length
    let snapshot = stack.inspector.snapshot();
    assert_eq!(snapshot.length, 2);
    assert!(snapshot.is_processing);

    let cancelled = stack
        .queue
        .all()
        .iter()
        .filter(|r| r.status == RequestStatus::Cancelled)
        .count();
    assert_eq!(cancelled, 5);

    // The in-flight two finish normally once released
    stack.gate.add_permits(8);
    let queue = stack.queue.clone();
    assert!(
        wait_for(
            || {
                queue
                    .all()
                    .iter()
                    .filter(|r| r.status == RequestStatus::Completed)
                    .count()
                    == 2
            },
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(stack.inspector.snapshot().length, 0);
}

#[tokio::test]
async fn remove_cancels_one_queued_request() {
    let stack = build_stack(10, 1);

    let first = stack.admission.accept(submission("first")).await.unwrap();
    let second = stack.admission.accept(submission("second")).await.unwrap();

    // Wait until the first is in flight; the second is still queued
    let queue = stack.queue.clone();
    assert!(
        wait_for(
            || {
                queue
                    .get(first)
                    .map(|r| r.status == RequestStatus::Dispatched)
                    .unwrap_or(false)
            },
            Duration::from_secs(5)
        )
        .await
    );

    stack.inspector.remove(second).unwrap();
    assert_eq!(
        stack.queue.get(second).unwrap().status,
        RequestStatus::Cancelled
    );

    // Removing an in-flight request is refused
    let err = stack.inspector.remove(first).unwrap_err();
    assert!(matches!(err, DispatchError::RequestNotPending(_)));

    // Unknown id
    let err = stack.inspector.remove(uuid::Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, DispatchError::RequestNotFound(_)));

    // The cancelled request never dispatches; only the first completes
    stack.gate.add_permits(4);
    let queue = stack.queue.clone();
    assert!(
        wait_for(
            || {
                queue
                    .get(first)
                    .map(|r| r.status == RequestStatus::Completed)
                    .unwrap_or(false)
            },
            Duration::from_secs(5)
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        stack.queue.get(second).unwrap().status,
        RequestStatus::Cancelled
    );
}

#[tokio::test]
async fn snapshot_goes_critical_at_capacity() {
    let stack = build_stack(4, 1);

    for i in 0..4 {
        stack
            .admission
            .accept(submission(&format!("prompt {}", i)))
            .await
            .unwrap();
    }

    let snapshot = stack.inspector.snapshot();
    assert_eq!(snapshot.length, 4);
    assert_eq!(
        snapshot.health.status,
        pq_common::QueueHealthStatus::Critical
    );
    assert!(snapshot
        .health
        .issues
        .iter()
        .any(|i| i.contains("at capacity")));
}
