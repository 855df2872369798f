//! Bearer-token guard for the `/admin` routes.

use axum::{
    body::Body,
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::error::ServerError;
use crate::state::AppState;

/// Constant-time token check. A length mismatch still runs a full comparison.
fn tokens_match(provided: &str, expected: &str) -> bool {
    let (provided, expected) = (provided.as_bytes(), expected.as_bytes());
    let same_len = provided.len() == expected.len();
    let candidate = if same_len { provided } else { expected };
    bool::from(candidate.ct_eq(expected)) && same_len
}

/// Require the configured admin bearer token, if any.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ServerError> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or_else(|| ServerError::Unauthorized("Missing authorization token".to_string()))?
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ServerError::Unauthorized("Invalid authorization format".to_string()))?;

    if !tokens_match(provided, expected) {
        return Err(ServerError::Unauthorized("Invalid token".to_string()));
    }

    Ok(next.run(request).await)
}
