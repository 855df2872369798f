//! Quota reporting endpoints.

use std::collections::BTreeMap;

use axum::{Json, extract::State};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tado_proxy_auth::ratelimit::{berlin_midnight_at, ratelimit_cutoff_at};
use tado_proxy_store::{TokenFilter, TokenStatus};

use crate::error::Result;
use crate::state::AppState;

/// Usage of one token in the current quota window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
    pub status: TokenStatus,
}

/// `GET /api/ratelimits`
///
/// Usage per token id against the current quota window. Tokens of every
/// status are reported.
pub async fn ratelimits_handler(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, TokenUsage>>> {
    let cutoff = ratelimit_cutoff_at(Utc::now());
    let mut usage = BTreeMap::new();

    for token in state.store.list_tokens(&TokenFilter::default())? {
        let client = state.store.get_client(&token.client)?;
        let used = state.store.count_requests(&token.id, cutoff)?;
        usage.insert(
            token.id,
            TokenUsage {
                used,
                limit: client.daily_limit,
                remaining: client.daily_limit - used,
                status: token.status,
            },
        );
    }

    Ok(Json(usage))
}

/// Request counts across all tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsResponse {
    /// Since midnight Europe/Berlin.
    pub today: i64,
    pub last_hour: i64,
    pub last_24_hours: i64,
}

/// `GET /api/stats`
pub async fn stats_handler(State(state): State<AppState>) -> Result<Json<StatsResponse>> {
    let now = Utc::now();
    Ok(Json(StatsResponse {
        today: state.store.count_all_requests(berlin_midnight_at(now))?,
        last_hour: state.store.count_all_requests(now - Duration::hours(1))?,
        last_24_hours: state.store.count_all_requests(now - Duration::hours(24))?,
    }))
}
