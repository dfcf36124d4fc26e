use chrono::{DateTime, Utc};
use pq_common::{ImageRef, QueuedRequest, RequestStatus};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Response after a submission is admitted
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Generated request ID, usable for status polling
    pub id: Uuid,
    /// Status at admission time (always Queued)
    pub status: RequestStatus,
}

/// Status of a single request
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatusResponse {
    pub id: Uuid,
    pub status: RequestStatus,
    pub attempts: u32,
    pub providers: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    /// Last failure classification, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Result of a completed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
}

impl From<QueuedRequest> for RequestStatusResponse {
    fn from(req: QueuedRequest) -> Self {
        Self {
            id: req.id,
            status: req.status,
            attempts: req.attempts,
            providers: req.providers,
            submitted_at: req.submitted_at,
            last_error: req.last_error,
            image: req.image,
        }
    }
}

/// Response after an admin clear
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClearQueueResponse {
    /// Number of pending requests that were cancelled
    pub cleared_count: usize,
}

/// Response after an admin remove
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoveRequestResponse {
    pub id: Uuid,
    pub status: RequestStatus,
}

/// Error body for rejected and failed calls
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Stable machine-readable code, e.g. "QueueFull"
    pub error: String,
    /// Human-readable description
    pub message: String,
}

/// Simple health response for basic health check
#[derive(Debug, Serialize, ToSchema)]
pub struct SimpleHealthResponse {
    /// Health status: UP, DEGRADED
    pub status: String,
    /// Application version
    pub version: String,
}

/// Kubernetes probe response
#[derive(Debug, Serialize, ToSchema)]
pub struct ProbeResponse {
    /// Probe status: LIVE, READY, NOT_READY
    pub status: String,
}
