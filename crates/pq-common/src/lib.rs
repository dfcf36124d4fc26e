use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use utoipa::ToSchema;
use uuid::Uuid;

pub mod logging;

// ============================================================================
// Submission Types
// ============================================================================

/// A prompt-generation submission as received from the outer system.
///
/// Everything here is immutable once admitted; the queue copies it into a
/// [`QueuedRequest`] and never mutates the payload afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSubmission {
    pub user_id: String,
    pub prompt: String,
    /// Ordered list of provider names this request may be dispatched to.
    pub providers: Vec<String>,
    #[serde(default)]
    pub guidance: GuidanceParams,
}

/// Generation parameters forwarded verbatim to the provider adapter.
///
/// Common knobs get typed fields; anything provider-specific rides along in
/// `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct GuidanceParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Reference to a generated image, as returned by a provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub url: String,
    /// Name of the provider that produced the image.
    pub provider: String,
}

// ============================================================================
// Queued Request
// ============================================================================

/// Lifecycle state of a queued generation request.
///
/// `Queued -> Dispatched -> {Completed | Retrying | Failed}`,
/// `Retrying -> Dispatched | Failed`, and any non-terminal state may move to
/// `Cancelled`. Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum RequestStatus {
    Queued,
    Dispatched,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Pending = counted in queue length: Queued, Dispatched or Retrying.
    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }
}

/// A generation request owned by the queue from admission until eviction.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub user_id: String,
    pub prompt: String,
    pub providers: Vec<String>,
    pub guidance: GuidanceParams,
    pub status: RequestStatus,
    /// Dispatch attempts performed so far. Monotonically increasing.
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    /// Monotonic twin of `submitted_at`, used for age computations.
    pub enqueued_at: Instant,
    pub last_error: Option<String>,
    /// Earliest re-dispatch time while `Retrying`.
    pub next_attempt_at: Option<Instant>,
    /// When the request reached a terminal state, for retention eviction.
    pub finished_at: Option<Instant>,
    /// Result of a successful generation.
    pub image: Option<ImageRef>,
}

impl QueuedRequest {
    pub fn new(submission: GenerationSubmission) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: submission.user_id,
            prompt: submission.prompt,
            providers: submission.providers,
            guidance: submission.guidance,
            status: RequestStatus::Queued,
            attempts: 0,
            submitted_at: Utc::now(),
            enqueued_at: Instant::now(),
            last_error: None,
            next_attempt_at: None,
            finished_at: None,
            image: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn age_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.enqueued_at).as_millis() as u64
    }
}

// ============================================================================
// Snapshot & Health Types
// ============================================================================

/// Derived health verdict for the queue. Never the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum QueueHealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub status: QueueHealthStatus,
    /// Human-readable descriptions of every condition currently true.
    pub issues: Vec<String>,
}

impl QueueHealth {
    pub fn healthy() -> Self {
        Self {
            status: QueueHealthStatus::Healthy,
            issues: Vec::new(),
        }
    }
}

/// Projection of one non-terminal request for the operator surface.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: Uuid,
    pub user_id: String,
    pub prompt: String,
    pub providers: Vec<String>,
    pub status: RequestStatus,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl From<&QueuedRequest> for PendingRequest {
    fn from(req: &QueuedRequest) -> Self {
        Self {
            id: req.id,
            user_id: req.user_id.clone(),
            prompt: req.prompt.clone(),
            providers: req.providers.clone(),
            status: req.status,
            attempts: req.attempts,
            timestamp: req.submitted_at,
        }
    }
}

/// Point-in-time, read-only projection of the whole queue.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Count of requests with status in {Queued, Dispatched, Retrying}.
    pub length: usize,
    /// True iff at least one request is currently Dispatched.
    pub is_processing: bool,
    /// Age of the oldest pending request; 0 when none are pending.
    pub oldest_request_age_ms: u64,
    pub pending_requests: Vec<PendingRequest>,
    pub health: QueueHealth,
}
