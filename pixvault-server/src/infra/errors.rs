use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use pixvault_core::error::{
    AdmissionError, BlobError, IngestError, QueueError, StoreError,
};

pub type AppResult<T> = Result<T, AppError>;

pub const OVERLOADED_MESSAGE: &str =
    "Service temporarily overloaded, retry later";

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn overloaded() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, OVERLOADED_MESSAGE)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::SourceNotFound { external_id, .. } => {
                Self::not_found(format!("Photo {external_id} not found"))
            }
            other => {
                tracing::error!(
                    error = %other,
                    kind = other.kind().as_str(),
                    "ingestion failed"
                );
                Self::internal(other.to_string())
            }
        }
    }
}

impl From<AdmissionError> for AppError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::TimedOut(_) => Self::overloaded(),
            AdmissionError::Cancelled | AdmissionError::Closed => {
                Self::unavailable("Server is shutting down")
            }
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        tracing::error!(error = %err, "queue operation failed");
        Self::internal(format!("Failed to enqueue task: {err}"))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "photo store operation failed");
        Self::internal("Database operation failed")
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(key) => {
                Self::not_found(format!("Blob {key} not found"))
            }
            other => {
                tracing::error!(error = %other, "blob store operation failed");
                Self::internal("Blob storage failed")
            }
        }
    }
}
