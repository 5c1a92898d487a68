//! Error types surfaced by the exporter and their HTTP projection.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ApiErrorResponse;

/// Errors produced by the snapshot engine and its collaborators.
#[derive(Debug, Error)]
pub enum ExporterError {
    /// A VM, snapshot or disk could not be resolved.
    #[error("{0}")]
    NotFound(String),

    /// Authentication against the OVM manager or token validation failed.
    #[error("{0}")]
    Unauthorized(String),

    /// Malformed input, including invalid compareTo ordering.
    #[error("{0}")]
    BadRequest(String),

    /// The requested resource exists but does not belong to the addressed
    /// VM, or a snapshot id collided.
    #[error("{0}")]
    Conflict(String),

    /// The disk or its repository does not support reflink cloning.
    #[error("{0} does not support reflink cloning")]
    NotCloneable(String),

    /// Metadata store failure.
    #[error("database error: {0}")]
    Storage(#[from] sled::Error),

    /// Clone, extent-map or other filesystem operation failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl ExporterError {
    /// Wraps an I/O error with a short description of the failed operation.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ExporterError::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns the HTTP status this error projects to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ExporterError::NotFound(_) => StatusCode::NOT_FOUND,
            ExporterError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ExporterError::BadRequest(_) | ExporterError::NotCloneable(_) => {
                StatusCode::BAD_REQUEST
            }
            ExporterError::Conflict(_) => StatusCode::CONFLICT,
            ExporterError::Storage(_) | ExporterError::Io { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ExporterError::NotFound(_) => "Not Found",
            ExporterError::Unauthorized(_) => "Not Authorized",
            ExporterError::BadRequest(_) | ExporterError::NotCloneable(_) => "Bad Request",
            ExporterError::Conflict(_) => "Conflict",
            ExporterError::Storage(_) | ExporterError::Io { .. } => "Server error",
        }
    }
}

impl IntoResponse for ExporterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ApiErrorResponse {
            error: self.kind().to_string(),
            details: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type alias for exporter operations.
pub type ExporterResult<T> = Result<T, ExporterError>;
