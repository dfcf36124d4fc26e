//! PixelQueue HTTP API
//!
//! HTTP API endpoints for:
//! - Generation request submission and status polling
//! - Operator queue snapshot
//! - Admin mutations (clear queue, remove request)
//! - Provider budget and circuit breaker visibility
//! - Kubernetes probes (liveness/readiness)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use pq_common::{
    GenerationSubmission, GuidanceParams, ImageRef, PendingRequest, QueueHealth,
    QueueHealthStatus, QueueSnapshot, RequestStatus,
};

use crate::admission::AdmissionController;
use crate::breaker::CircuitState;
use crate::dispatcher::{ProviderDispatcher, ProviderStats};
use crate::error::DispatchError;
use crate::inspector::QueueInspector;

pub mod model;

use model::{
    ClearQueueResponse, ErrorResponse, ProbeResponse, RemoveRequestResponse,
    RequestStatusResponse, SimpleHealthResponse, SubmitResponse,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionController>,
    pub inspector: Arc<QueueInspector>,
    pub dispatcher: Arc<ProviderDispatcher>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        submit_request,
        get_request,
        queue_status,
        clear_queue,
        remove_request,
        provider_stats,
        reset_provider_circuit,
        health_handler,
        liveness_probe,
        readiness_probe,
    ),
    components(schemas(
        GenerationSubmission,
        GuidanceParams,
        ImageRef,
        RequestStatus,
        QueueSnapshot,
        PendingRequest,
        QueueHealth,
        QueueHealthStatus,
        ProviderStats,
        CircuitState,
        SubmitResponse,
        RequestStatusResponse,
        ClearQueueResponse,
        RemoveRequestResponse,
        ErrorResponse,
        SimpleHealthResponse,
        ProbeResponse,
    )),
    tags(
        (name = "requests", description = "Generation request submission and polling"),
        (name = "queue", description = "Operator queue snapshot and admin mutations"),
        (name = "providers", description = "Provider budget and circuit breaker visibility"),
        (name = "health", description = "Health check endpoints"),
    )
)]
pub struct ApiDoc;

/// Create the full router with all endpoints
pub fn create_router(
    admission: Arc<AdmissionController>,
    inspector: Arc<QueueInspector>,
    dispatcher: Arc<ProviderDispatcher>,
) -> Router {
    let state = AppState {
        admission,
        inspector,
        dispatcher,
    };

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        // Requests
        .route("/api/v1/requests", post(submit_request))
        .route("/api/v1/requests/:id", get(get_request))
        // Queue admin surface
        .route("/api/v1/queue/status", get(queue_status))
        .route("/api/v1/queue/clear", post(clear_queue))
        .route("/api/v1/queue/requests/:id", delete(remove_request))
        // Providers
        .route("/api/v1/providers", get(provider_stats))
        .route(
            "/api/v1/providers/:name/circuit/reset",
            post(reset_provider_circuit),
        )
        // Health
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .with_state(state)
}

/// Map a dispatch error to its HTTP response
fn error_response(error: &DispatchError) -> Response {
    let status = match error {
        DispatchError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::DuplicateRequest => StatusCode::CONFLICT,
        DispatchError::InsufficientCredit => StatusCode::PAYMENT_REQUIRED,
        DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        DispatchError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::RequestNotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::RequestNotPending(_) => StatusCode::CONFLICT,
        DispatchError::ShutdownInProgress => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::RetryExhausted
        | DispatchError::Cancelled
        | DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let body = ErrorResponse {
        error: error.code().to_string(),
        message: error.to_string(),
    };
    (status, Json(body)).into_response()
}

// ============================================================================
// Request Endpoints
// ============================================================================

/// Submit a generation request
#[utoipa::path(
    post,
    path = "/api/v1/requests",
    tag = "requests",
    request_body = GenerationSubmission,
    responses(
        (status = 202, description = "Request admitted", body = SubmitResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 402, description = "Insufficient credit", body = ErrorResponse),
        (status = 409, description = "Duplicate request", body = ErrorResponse),
        (status = 503, description = "Queue full or providers unavailable", body = ErrorResponse),
    )
)]
async fn submit_request(
    State(state): State<AppState>,
    Json(submission): Json<GenerationSubmission>,
) -> Response {
    match state.admission.accept(submission).await {
        Ok(id) => (
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                id,
                status: RequestStatus::Queued,
            }),
        )
            .into_response(),
        Err(error) => error_response(&error),
    }
}

/// Poll the status of one request
#[utoipa::path(
    get,
    path = "/api/v1/requests/{id}",
    tag = "requests",
    params(("id" = Uuid, Path, description = "Request ID")),
    responses(
        (status = 200, description = "Request status", body = RequestStatusResponse),
        (status = 404, description = "Unknown request", body = ErrorResponse),
    )
)]
async fn get_request(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.inspector.get(id) {
        Some(request) => Json(RequestStatusResponse::from(request)).into_response(),
        None => error_response(&DispatchError::RequestNotFound(id)),
    }
}

// ============================================================================
// Queue Endpoints
// ============================================================================

/// Read-only queue snapshot for operators
#[utoipa::path(
    get,
    path = "/api/v1/queue/status",
    tag = "queue",
    responses(
        (status = 200, description = "Queue snapshot", body = QueueSnapshot)
    )
)]
async fn queue_status(State(state): State<AppState>) -> Json<QueueSnapshot> {
    Json(state.inspector.snapshot())
}

/// Cancel every pending request (admin). Authorization happens upstream.
#[utoipa::path(
    post,
    path = "/api/v1/queue/clear",
    tag = "queue",
    responses(
        (status = 200, description = "Pending requests cancelled", body = ClearQueueResponse)
    )
)]
async fn clear_queue(State(state): State<AppState>) -> Json<ClearQueueResponse> {
    let cleared_count = state.inspector.clear();
    Json(ClearQueueResponse { cleared_count })
}

/// Cancel one pending request (admin)
#[utoipa::path(
    delete,
    path = "/api/v1/queue/requests/{id}",
    tag = "queue",
    params(("id" = Uuid, Path, description = "Request ID")),
    responses(
        (status = 200, description = "Request cancelled", body = RemoveRequestResponse),
        (status = 404, description = "Unknown request", body = ErrorResponse),
        (status = 409, description = "Request already dispatched or terminal", body = ErrorResponse),
    )
)]
async fn remove_request(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.inspector.remove(id) {
        Ok(()) => Json(RemoveRequestResponse {
            id,
            status: RequestStatus::Cancelled,
        })
        .into_response(),
        Err(error) => {
            warn!(request_id = %id, error = %error, "Remove rejected");
            error_response(&error)
        }
    }
}

// ============================================================================
// Provider Endpoints
// ============================================================================

/// Provider budgets and circuit breaker states
#[utoipa::path(
    get,
    path = "/api/v1/providers",
    tag = "providers",
    responses(
        (status = 200, description = "Provider stats", body = [ProviderStats])
    )
)]
async fn provider_stats(State(state): State<AppState>) -> Json<Vec<ProviderStats>> {
    Json(state.dispatcher.provider_stats())
}

/// Force a provider's circuit closed (operator action)
#[utoipa::path(
    post,
    path = "/api/v1/providers/{name}/circuit/reset",
    tag = "providers",
    params(("name" = String, Path, description = "Provider name")),
    responses(
        (status = 200, description = "Circuit reset"),
        (status = 400, description = "Unknown provider", body = ErrorResponse),
    )
)]
async fn reset_provider_circuit(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    if state.dispatcher.reset_circuit(&name) {
        StatusCode::OK.into_response()
    } else {
        error_response(&DispatchError::InvalidRequest(format!(
            "unknown provider: {}",
            name
        )))
    }
}

// ============================================================================
// Health Endpoints
// ============================================================================

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = SimpleHealthResponse)
    )
)]
async fn health_handler(State(state): State<AppState>) -> Json<SimpleHealthResponse> {
    let health = state.inspector.health();

    let status = match health.status {
        QueueHealthStatus::Healthy | QueueHealthStatus::Warning => "UP",
        QueueHealthStatus::Critical => "DEGRADED",
    };

    Json(SimpleHealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Kubernetes liveness probe - returns 200 if the application is running
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is live", body = ProbeResponse)
    )
)]
async fn liveness_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse {
        status: "LIVE".to_string(),
    })
}

/// Kubernetes readiness probe - returns 200 while admission is open
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready", body = ProbeResponse),
        (status = 503, description = "Application is not ready", body = ProbeResponse)
    )
)]
async fn readiness_probe(State(state): State<AppState>) -> Response {
    if state.admission.is_open() && state.dispatcher.is_running() {
        (
            StatusCode::OK,
            Json(ProbeResponse {
                status: "READY".to_string(),
            }),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse {
                status: "NOT_READY".to_string(),
            }),
        )
            .into_response()
    }
}
