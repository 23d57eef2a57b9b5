//! HTTP request handlers.

use super::AppState;
use crate::config::StatsConfig;
use crate::monitor::TargetState;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

// ============================================================================
// API: Servers
// ============================================================================

/// Public view of one target.
#[derive(Debug, Serialize)]
pub struct ServerView {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub online: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_ping: Option<DateTime<Utc>>,
    pub abnormal: bool,
    pub abnormal_ping: bool,
    pub abnormal_loss: bool,
    pub abnormal_jitter: bool,
    pub ping: Option<f64>,
    pub loss: f64,
    pub pings: u64,
    /// Samples per second since the process started.
    pub ping_rate: f64,
    pub baseline: f64,
    pub jitter: f64,
}

impl ServerView {
    pub fn new(
        state: &TargetState,
        cfg: &StatsConfig,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let class = state.classify(cfg);
        let uptime = (now - started_at).num_milliseconds() as f64 / 1000.0;
        let ping_rate = if uptime > 0.0 {
            state.sample_count() as f64 / uptime
        } else {
            0.0
        };

        Self {
            id: state.id,
            name: state.name.clone(),
            url: state.address.clone(),
            online: state.online,
            last_check: state.last_checked_at,
            last_ping: state.last_probed_at,
            abnormal: class.abnormal,
            abnormal_ping: class.abnormal_ping,
            abnormal_loss: class.abnormal_loss,
            abnormal_jitter: class.abnormal_jitter,
            ping: state.average(),
            loss: state.loss(),
            pings: state.sample_count(),
            ping_rate,
            baseline: state.baseline_value(),
            jitter: state.jitter(),
        }
    }
}

pub async fn handle_get_servers(State(state): State<AppState>) -> impl IntoResponse {
    let cfg = state.config.current();
    let started_at = state.registry.started_at();
    let now = Utc::now();

    let servers: Vec<ServerView> = state
        .registry
        .snapshot()
        .iter()
        .map(|target| ServerView::new(target, &cfg.stats, started_at, now))
        .collect();

    Json(servers)
}

// ============================================================================
// API: Pings
// ============================================================================

pub async fn handle_get_pings(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.registry.get(id) {
        Some(slot) => {
            let pings: Vec<f64> = slot.read().history().iter().copied().collect();
            Json(json!({ "error": false, "pings": pings })).into_response()
        }
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": true }))).into_response(),
    }
}

// ============================================================================
// API: Results
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub window: Option<i64>,
    pub start: Option<String>,
    pub end: Option<String>,
}

fn parse_time(raw: Option<&String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub async fn handle_get_results(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ResultsQuery>,
) -> impl IntoResponse {
    if state.registry.get(id).is_none() {
        return (StatusCode::NOT_FOUND, "Target not found").into_response();
    }

    let window = query.window.unwrap_or(60);
    if window != 60 && window != 600 {
        return (StatusCode::BAD_REQUEST, "window must be 60 or 600").into_response();
    }

    // Default to the last hour
    let end = parse_time(query.end.as_ref()).unwrap_or_else(Utc::now);
    let start =
        parse_time(query.start.as_ref()).unwrap_or_else(|| end - ChronoDuration::hours(1));

    match state.store.get_rollups(id, window, start, end) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            tracing::error!("Failed to read results for target {}: {}", id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
