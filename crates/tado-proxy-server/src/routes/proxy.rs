//! The proxy dispatcher.
//!
//! Every inbound `/api/v2/...` call is relayed upstream with one of the
//! stored tokens:
//!
//! ```text
//! filter (X-Tado-Email, /homes/{id})
//!   → usable tokens, least recently used first
//!   → drop tokens at their daily limit (totals kept for headers)
//!   → deviceCode tokens first, then the rest
//!   → try each: transport error / refresh failure / 401 → next
//!   → first other response is relayed with aggregate RateLimit headers
//! ```

use std::sync::LazyLock;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
        header::{self, AUTHORIZATION},
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use tado_proxy_auth::RequestClass;
use tado_proxy_auth::ratelimit::{QuotaTotals, parse_daily_quota, ratelimit_cutoff};
use tado_proxy_store::{Client, ClientType, NewRequestLog, RecordStore, Token, TokenFilter};

use crate::error::{Result, ServerError};
use crate::state::AppState;

/// Request header that scopes token selection to one account.
pub const ACCOUNT_EMAIL_HEADER: &str = "x-tado-email";

pub const RATELIMIT_HEADER: HeaderName = HeaderName::from_static("ratelimit");
pub const RATELIMIT_POLICY_HEADER: HeaderName = HeaderName::from_static("ratelimit-policy");

static HOME_PATH: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^/api/v2/homes/(\d+)").ok());

/// Inbound headers never forwarded upstream.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "authorization",
    ACCOUNT_EMAIL_HEADER,
    "host",
    "accept-encoding",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Upstream response headers not relayed to the caller.
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding"];

/// A token that may serve the current request.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub token: Token,
    pub client: Client,
}

/// Upstream home id addressed by `path`, if any.
pub fn home_id_from_path(path: &str) -> Option<i64> {
    HOME_PATH
        .as_ref()?
        .captures(path)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Tokens eligible for a request, in the order they should be tried.
///
/// Quota totals cover every matching token, including those excluded for
/// having reached their limit. Returns [`ServerError::NoTokens`] when the
/// filter matches nothing at all.
pub fn select_candidates(
    store: &dyn RecordStore,
    filter: &TokenFilter,
    cutoff: DateTime<Utc>,
) -> Result<(Vec<Candidate>, QuotaTotals)> {
    let tokens = store.list_tokens(filter)?;
    if tokens.is_empty() {
        return Err(ServerError::NoTokens);
    }

    let mut totals = QuotaTotals::default();
    let mut preferred = Vec::new();
    let mut other = Vec::new();

    for token in tokens {
        let client = store.get_client(&token.client)?;
        let used = store.count_requests(&token.id, cutoff)?;
        totals.add(used, client.daily_limit);

        if used >= client.daily_limit {
            tracing::debug!(token_id = %token.id, used, limit = client.daily_limit, "Token over daily limit");
            continue;
        }

        let candidate = Candidate { token, client };
        match candidate.client.client_type {
            ClientType::DeviceCode => preferred.push(candidate),
            ClientType::PasswordGrant => other.push(candidate),
        }
    }

    preferred.extend(other);
    Ok((preferred, totals))
}

/// Upstream URL for an inbound path and query.
pub fn upstream_url(api_base: &str, path: &str, query: Option<&str>, bypass: &str) -> String {
    match query.filter(|q| !q.is_empty()) {
        Some(query) => format!("{api_base}{path}?{query}&{bypass}"),
        None => format!("{api_base}{path}?{bypass}"),
    }
}

/// Inbound headers that are relayed upstream.
fn forwarded_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// `ANY /api/v2/{*path}`
pub async fn proxy_handler(State(state): State<AppState>, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();

    let mut filter = TokenFilter::usable();
    if let Some(email) = parts
        .headers
        .get(ACCOUNT_EMAIL_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        filter = filter.with_account_email(email);
    }
    if let Some(home) = home_id_from_path(parts.uri.path()) {
        filter = filter.with_home(home);
    }

    let (candidates, totals) = select_candidates(state.store.as_ref(), &filter, ratelimit_cutoff())?;

    let body = axum::body::to_bytes(body, state.config.max_body_size)
        .await
        .map_err(|e| ServerError::BadRequest(format!("Failed to read request body: {e}")))?;

    let url = upstream_url(
        &state.config.api_base,
        parts.uri.path(),
        parts.uri.query(),
        &state.config.bypass_param,
    );
    let inbound = forwarded_headers(&parts.headers);

    for (attempt, candidate) in candidates.into_iter().enumerate() {
        let token_id = candidate.token.id.clone();

        let token = match state.tokens.get_valid_token(&candidate.token).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(%token_id, attempt, error = %e, "Skipping token without valid credentials");
                continue;
            }
        };

        let mut dynamic = inbound.clone();
        let Ok(mut bearer) = HeaderValue::from_str(&format!("Bearer {}", token.access_token)) else {
            tracing::warn!(%token_id, attempt, "Access token is not a valid header value");
            continue;
        };
        bearer.set_sensitive(true);
        dynamic.insert(AUTHORIZATION, bearer);

        let upstream = state
            .http
            .request(
                candidate.client.platform,
                RequestClass::Api,
                parts.method.clone(),
                &url,
                &dynamic,
            )
            .body(body.clone())
            .send()
            .await;

        let upstream = match upstream {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(%token_id, attempt, error = %e, "Upstream request failed");
                continue;
            }
        };

        if upstream.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(%token_id, attempt, "Upstream rejected token");
            if let Err(e) = state.tokens.mark_token_invalid(&token_id).await {
                tracing::error!(%token_id, error = %e, "Failed to mark token invalid");
            }
            continue;
        }

        return Ok(relay(&state, &candidate.client, &token_id, &parts.method, &url, totals, upstream));
    }

    Err(ServerError::TokensExhausted)
}

/// Turn the chosen upstream response into the caller's response.
fn relay(
    state: &AppState,
    client: &Client,
    token_id: &str,
    method: &Method,
    url: &str,
    totals: QuotaTotals,
    upstream: reqwest::Response,
) -> Response {
    let status = upstream.status();

    if let Err(e) = state.tokens.update_token_used(token_id) {
        tracing::error!(token_id, error = %e, "Failed to update token usage");
    }

    if let Some(quota) = upstream
        .headers()
        .get(RATELIMIT_POLICY_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_daily_quota)
        && quota != client.daily_limit
    {
        match state.store.set_client_daily_limit(&client.id, quota) {
            Ok(()) => tracing::info!(
                client_id = %client.client_id,
                old = client.daily_limit,
                new = quota,
                "Updated client daily limit"
            ),
            Err(e) => tracing::error!(client_id = %client.client_id, error = %e, "Failed to update daily limit"),
        }
    }

    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    // Header names are case-insensitive; one entry serves both the
    // canonical and legacy casing.
    for (name, value) in [
        (RATELIMIT_HEADER, totals.ratelimit_header()),
        (RATELIMIT_POLICY_HEADER, totals.policy_header()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    headers.remove(header::CONTENT_LENGTH);

    let entry = NewRequestLog {
        token: token_id.to_string(),
        method: method.to_string(),
        url: url.to_string(),
        status: status.as_u16(),
    };
    if let Err(e) = state.store.log_request(&entry) {
        tracing::error!(token_id, error = %e, "Failed to log request");
    }
    tracing::debug!(token_id, status = status.as_u16(), "Relaying upstream response");

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
