//! Per-request access log.

use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Level;

use crate::state::AppState;

fn level_for(status: axum::http::StatusCode) -> Level {
    if status.is_server_error() {
        Level::ERROR
    } else if status.is_client_error() {
        Level::WARN
    } else {
        Level::INFO
    }
}

/// Log method, path, status and duration once the response is ready.
///
/// The query string is left out so that caller-supplied values stay out of
/// the logs. Disabled by `request_logging = false`.
pub async fn request_logging_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.request_logging {
        return next.run(request).await;
    }

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started = Instant::now();

    let response = next.run(request).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let status = response.status();

    let level = level_for(status);
    if level == Level::ERROR {
        tracing::error!(%method, %path, status = status.as_u16(), elapsed_ms, "request failed");
    } else if level == Level::WARN {
        tracing::warn!(%method, %path, status = status.as_u16(), elapsed_ms, "request rejected");
    } else {
        tracing::info!(%method, %path, status = status.as_u16(), elapsed_ms, "request served");
    }

    response
}
