//! Login handler.

use axum::{extract::State, Json};

use crate::auth::jwt::issue_token;
use crate::error::ExporterResult;
use crate::models::{LoginRequest, LoginResponse};
use crate::router::AppState;

/// POST /api/v1/auth/login
///
/// Validates the supplied credentials against the OVM manager and returns
/// a bearer token on success.
pub async fn login(
    State(state): State<AppState>,
    Json(login): Json<LoginRequest>,
) -> ExporterResult<Json<LoginResponse>> {
    state
        .ovm
        .validate_credentials(&login.username, &login.password)
        .await?;
    let token = issue_token(&state.config.jwt, &login.username)?;
    Ok(Json(LoginResponse { token }))
}
