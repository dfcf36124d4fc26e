//! RetryCoordinator - failure classification and backoff scheduling
//!
//! Dispatch failures are classified as retryable (timeout, 5xx, provider
//! rate limiting) or fatal (refused prompt, auth, exhausted quota). Retryable
//! failures re-enter the queue after an exponential backoff with jitter;
//! fatal ones and exhausted retry budgets terminate the request.

use crate::metrics;
use crate::provider::ProviderError;
use crate::queue::RequestQueue;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// How a dispatch failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth another attempt after backoff.
    Retryable,
    /// Terminal; the provider will never accept this request.
    Fatal,
}

pub fn classify(error: &ProviderError) -> FailureClass {
    if error.is_retryable() {
        FailureClass::Retryable
    } else {
        FailureClass::Fatal
    }
}

/// Retry policy: `backoff(n) = base * 2^n` with +/-20% jitter, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total dispatch attempts per request, including the first.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`, given `attempt` attempts done.
    pub fn backoff(&self, attempt: u32) -> Duration {
        // Cap the exponent so the shift cannot overflow
        let exp = attempt.min(16);
        let raw_ms = (self.backoff_base.as_millis() as u64).saturating_mul(1u64 << exp);
        let capped_ms = raw_ms.min(self.backoff_max.as_millis() as u64);

        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        let with_jitter = Duration::from_millis((capped_ms as f64 * jitter) as u64);
        with_jitter.min(self.backoff_max)
    }
}

/// Decides the fate of failed dispatches and re-arms the dispatcher when a
/// backoff elapses.
pub struct RetryCoordinator {
    queue: Arc<RequestQueue>,
    policy: RetryPolicy,
    work_notify: Arc<Notify>,
}

impl RetryCoordinator {
    pub fn new(queue: Arc<RequestQueue>, policy: RetryPolicy, work_notify: Arc<Notify>) -> Self {
        Self {
            queue,
            policy,
            work_notify,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Route one dispatch failure. Returns true when the request reached a
    /// terminal `Failed` state (the caller fires the failure hook).
    pub fn handle_failure(
        &self,
        request_id: Uuid,
        provider: &str,
        attempts: u32,
        error: &ProviderError,
    ) -> bool {
        match classify(error) {
            FailureClass::Fatal => {
                warn!(
                    request_id = %request_id,
                    provider = %provider,
                    error = %error,
                    "Fatal provider error, failing request"
                );
                self.queue.fail(request_id, error.to_string())
            }
            FailureClass::Retryable if attempts < self.policy.max_attempts => {
                let mut delay = self.policy.backoff(attempts);
                // Honor the provider's Retry-After when it is longer
                if let ProviderError::RateLimited { retry_after_secs } = error {
                    delay = delay.max(Duration::from_secs(u64::from(*retry_after_secs)));
                }
                let scheduled = self.queue.mark_retrying(
                    request_id,
                    error.to_string(),
                    Instant::now() + delay,
                );
                if scheduled {
                    debug!(
                        request_id = %request_id,
                        provider = %provider,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retry scheduled"
                    );
                    metrics::record_retry_scheduled(provider);

                    // Timer task wakes the workers once the backoff elapses.
                    // The request itself stays at its original queue position.
                    let notify = self.work_notify.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        notify.notify_waiters();
                    });
                }
                false
            }
            FailureClass::Retryable => {
                warn!(
                    request_id = %request_id,
                    provider = %provider,
                    attempts = attempts,
                    "Retry budget exhausted, failing request"
                );
                self.queue.fail(
                    request_id,
                    format!(
                        "retry budget exhausted after {} attempts: {}",
                        attempts, error
                    ),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
        };

        // Jitter is +/-20%, so check the envelope
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(160) && first <= Duration::from_millis(240));

        let second = policy.backoff(2);
        assert!(second >= Duration::from_millis(320) && second <= Duration::from_millis(480));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 64,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        };

        // 100ms * 2^40 would overflow without the exponent cap
        assert!(policy.backoff(40) <= Duration::from_secs(5));
    }

    #[test]
    fn classification_follows_provider_error() {
        assert_eq!(
            classify(&ProviderError::Timeout(Duration::from_secs(1))),
            FailureClass::Retryable
        );
        assert_eq!(
            classify(&ProviderError::Rejected("policy violation".into())),
            FailureClass::Fatal
        );
        assert_eq!(classify(&ProviderError::QuotaExhausted), FailureClass::Fatal);
    }
}
