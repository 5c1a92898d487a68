//! HTTP request handlers.

pub mod auth;
pub mod disks;
pub mod snapshots;
pub mod vms;

use axum::{http::StatusCode, response::IntoResponse, Json};

use crate::models::ApiErrorResponse;

/// Fallback handler for unknown routes.
pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ApiErrorResponse {
            error: "Not Found".to_string(),
            details: "The resource you are looking for was not found".to_string(),
        }),
    )
}
