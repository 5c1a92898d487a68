//! JWT issuance and the bearer-token middleware guarding the API.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::JwtConfig;
use crate::error::{ExporterError, ExporterResult};
use crate::models::ApiErrorResponse;
use crate::router::AppState;

const TOKEN_ISSUER: &str = "coriolis-ovm-exporter";

/// Claims carried by issued tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub user: String,
    pub iss: String,
    pub exp: i64,
}

/// Signs a new token for `user`, valid for the configured lifetime.
pub fn issue_token(cfg: &JwtConfig, user: &str) -> ExporterResult<String> {
    let ttl = chrono::Duration::from_std(cfg.time_to_live)
        .map_err(|e| ExporterError::BadRequest(format!("invalid token lifetime: {e}")))?;
    let claims = JwtClaims {
        user: user.to_string(),
        iss: TOKEN_ISSUER.to_string(),
        exp: (Utc::now() + ttl).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )
    .map_err(|e| ExporterError::io("signing token", std::io::Error::other(e)))
}

/// Validates an `Authorization: Bearer` header value.
pub fn validate_token(cfg: &JwtConfig, header: &str) -> Result<JwtClaims, ()> {
    let mut parts = header.splitn(2, ' ');
    let (Some(scheme), Some(token)) = (parts.next(), parts.next()) else {
        return Err(());
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(());
    }
    decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ())
}

fn invalid_auth_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiErrorResponse {
            error: "Authentication failed".to_string(),
            details: "Invalid authentication token".to_string(),
        }),
    )
        .into_response()
}

/// Middleware rejecting requests without a valid bearer token.
pub async fn authenticate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let Some(header) = header else {
        return invalid_auth_response();
    };
    if validate_token(&state.config.jwt, header).is_err() {
        return invalid_auth_response();
    }
    next.run(request).await
}
