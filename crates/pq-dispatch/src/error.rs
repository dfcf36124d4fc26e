use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Queue is full")]
    QueueFull,

    #[error("Duplicate request")]
    DuplicateRequest,

    #[error("Insufficient credit")]
    InsufficientCredit,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Retry budget exhausted")]
    RetryExhausted,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("Request {0} is not pending")]
    RequestNotPending(Uuid),

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Internal fault: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Stable machine-readable code, used as the rejection reason on the wire
    /// and as the metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull => "QueueFull",
            Self::DuplicateRequest => "DuplicateRequest",
            Self::InsufficientCredit => "InsufficientCredit",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::ProviderUnavailable(_) => "ProviderUnavailable",
            Self::RetryExhausted => "RetryExhausted",
            Self::Cancelled => "Cancelled",
            Self::RequestNotFound(_) => "RequestNotFound",
            Self::RequestNotPending(_) => "RequestNotPending",
            Self::ShutdownInProgress => "ShutdownInProgress",
            Self::Internal(_) => "InternalFault",
        }
    }
}
