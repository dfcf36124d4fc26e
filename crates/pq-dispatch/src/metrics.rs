//! Metrics infrastructure for the dispatch queue
//!
//! Provides Prometheus-compatible metrics for:
//! - Admission verdicts
//! - Dispatch counts and latency
//! - Retry scheduling
//! - Queue depth and in-flight gauges

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an accepted submission
pub fn record_admitted() {
    counter!("pq_requests_admitted_total").increment(1);
}

/// Record a rejected submission
pub fn record_rejected(reason: &str) {
    counter!(
        "pq_requests_rejected_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a finished provider dispatch
pub fn record_dispatch(provider: &str, success: bool, duration: Duration) {
    counter!(
        "pq_dispatches_total",
        "provider" => provider.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
    histogram!(
        "pq_dispatch_duration_seconds",
        "provider" => provider.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a retry being scheduled
pub fn record_retry_scheduled(provider: &str) {
    counter!(
        "pq_retries_scheduled_total",
        "provider" => provider.to_string()
    )
    .increment(1);
}

/// Record a worker waiting on the provider's rate limit
pub fn record_rate_limited(provider: &str) {
    counter!(
        "pq_rate_limited_total",
        "provider" => provider.to_string()
    )
    .increment(1);
}

/// Record requests cancelled by an admin clear
pub fn record_cleared(count: usize) {
    counter!("pq_requests_cleared_total").increment(count as u64);
}

/// Update the in-flight gauge for a provider
pub fn set_in_flight(provider: &str, count: u32) {
    gauge!(
        "pq_in_flight",
        "provider" => provider.to_string()
    )
    .set(count as f64);
}

/// Update the pending queue depth gauge
pub fn set_queue_depth(depth: usize) {
    gauge!("pq_queue_depth").set(depth as f64);
}
