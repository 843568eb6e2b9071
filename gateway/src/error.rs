//! Error types for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use modelgate_common::{BackendStatus, IllegalTransition};

/// Durable store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("IO error: {0}")]
    Io(String),
    /// A stored row could not be decoded back into a record.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Admission queue failures, surfaced to submitters.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue full for model {model}")]
    QueueFull { model: String },
    #[error("Model {model} is unavailable (backend {status})")]
    ModelUnavailable { model: String, status: BackendStatus },
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Backend call and process supervision failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Network or timeout class; the call may be retried.
    #[error("Transient backend error: {0}")]
    Transient(String),
    /// The backend rejected the payload; never retried.
    #[error("Fatal backend error: {0}")]
    Fatal(String),
    #[error("Backend launch failed: {0}")]
    Launch(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// Lifecycle manager failures.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
    #[error("Model {model} does not support resolution '{mode}'")]
    UnsupportedResolution { model: String, mode: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by the gateway facade.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),
    #[error("Item not found: {0}")]
    ItemNotFound(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GatewayError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            GatewayError::UnknownModel(_) => (StatusCode::NOT_FOUND, "unknown_model"),
            GatewayError::ItemNotFound(_) => (StatusCode::NOT_FOUND, "item_not_found"),
            GatewayError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            GatewayError::Queue(QueueError::QueueFull { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "queue_full")
            }
            GatewayError::Queue(QueueError::ModelUnavailable { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "model_unavailable")
            }
            GatewayError::Lifecycle(LifecycleError::UnknownModel(_)) => {
                (StatusCode::NOT_FOUND, "unknown_model")
            }
            GatewayError::Lifecycle(LifecycleError::IllegalTransition(_)) => {
                (StatusCode::CONFLICT, "illegal_transition")
            }
            GatewayError::Lifecycle(LifecycleError::UnsupportedResolution { .. }) => {
                (StatusCode::BAD_REQUEST, "unsupported_resolution")
            }
            GatewayError::Queue(QueueError::IllegalTransition(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            GatewayError::Queue(QueueError::Store(_))
            | GatewayError::Lifecycle(LifecycleError::Store(_))
            | GatewayError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();

        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
