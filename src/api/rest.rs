// =============================================================================
// REST API Endpoints - Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Reads are served from the latest
// published snapshot and never wait on the pipeline. Writes enqueue a command
// and return immediately; the effect shows up in the next snapshot.
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::ApiState;
use crate::error::FeedError;
use crate::types::{Candle, ConnectionState};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/candles", get(candles))
        .route("/api/v1/interval", post(set_interval))
        .route("/api/v1/refresh", post(refresh))
        .route("/api/v1/visibility", post(set_visibility))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct UpstreamStatus {
    endpoint: String,
    state: Option<ConnectionState>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connection_state: ConnectionState,
    is_loading: bool,
    last_error: Option<String>,
    visible: bool,
    upstreams: Vec<UpstreamStatus>,
    server_time: i64,
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let feed = &state.feed;
    let last_error = feed.last_error();
    let upstreams = state
        .hub
        .active_endpoints()
        .into_iter()
        .map(|endpoint| UpstreamStatus {
            state: state.hub.state(&endpoint),
            endpoint,
        })
        .collect();

    Json(HealthResponse {
        status: if last_error.is_some() { "degraded" } else { "ok" },
        connection_state: feed.connection_state(),
        is_loading: feed.is_loading(),
        last_error,
        visible: state.hub.is_visible(),
        upstreams,
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Snapshot reads
// =============================================================================

async fn full_state(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.feed.snapshot())
}

#[derive(Deserialize)]
struct CandlesQuery {
    /// Return only the most recent `limit` candles.
    limit: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CandlesResponse {
    version: u64,
    interval_seconds: i64,
    candles: Vec<Candle>,
}

async fn candles(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<CandlesQuery>,
) -> impl IntoResponse {
    let snapshot = state.feed.snapshot();
    let series = &snapshot.candle_series;
    let start = query
        .limit
        .map_or(0, |limit| series.len().saturating_sub(limit));

    Json(CandlesResponse {
        version: snapshot.version,
        interval_seconds: snapshot.interval_seconds,
        candles: series[start..].to_vec(),
    })
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Serialize)]
struct CommandResponse {
    accepted: bool,
    message: String,
}

fn accepted(message: impl Into<String>) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(CommandResponse {
            accepted: true,
            message: message.into(),
        }),
    )
        .into_response()
}

fn rejected(error: FeedError) -> Response {
    let status = match error {
        FeedError::InvalidInterval(_) => StatusCode::BAD_REQUEST,
        FeedError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %error, status = %status, "feed command rejected");
    (
        status,
        Json(CommandResponse {
            accepted: false,
            message: error.to_string(),
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntervalRequest {
    interval_seconds: i64,
}

async fn set_interval(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<IntervalRequest>,
) -> Response {
    match state.feed.set_interval(request.interval_seconds) {
        Ok(()) => {
            info!(interval_seconds = request.interval_seconds, "interval change requested via API");
            accepted(format!("interval set to {}s", request.interval_seconds))
        }
        Err(e) => rejected(e),
    }
}

async fn refresh(State(state): State<Arc<ApiState>>) -> Response {
    match state.feed.refresh() {
        Ok(()) => accepted("reloading cached snapshot"),
        Err(e) => rejected(e),
    }
}

#[derive(Deserialize)]
struct VisibilityRequest {
    visible: bool,
}

async fn set_visibility(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<VisibilityRequest>,
) -> Response {
    state.hub.set_visible(request.visible);
    accepted(if request.visible {
        "feed resumed"
    } else {
        "feed suspended"
    })
}
