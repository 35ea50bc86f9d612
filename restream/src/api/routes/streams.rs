//! Stream control and status routes.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/` | Status of every channel |
//! | GET | `/{id}` | Status of one channel |
//! | POST | `/{id}/start` | Start (idempotent); `?wait=true` waits for the first playlist |
//! | POST | `/{id}/stop` | Stop (idempotent) |
//! | POST | `/{id}/restart` | Stop then start |
//! | GET | `/{id}/logs` | Tail of the transcoder log (`?lines=N`) |

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::catalog::m3u::hls_entry_path;
use crate::stream::{StreamInfo, StreamStatus};

/// Default number of log lines returned.
const DEFAULT_LOG_LINES: usize = 100;

/// Upper bound on requested log lines.
const MAX_LOG_LINES: usize = 1000;

/// Upper bound on `timeout_secs` for `start?wait=true`.
const MAX_WAIT_SECS: u64 = 60;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_streams))
        .route("/{id}", get(get_stream))
        .route("/{id}/start", post(start_stream))
        .route("/{id}/stop", post(stop_stream))
        .route("/{id}/restart", post(restart_stream))
        .route("/{id}/logs", get(stream_logs))
}

#[derive(Debug, Default, Deserialize)]
pub struct StartQuery {
    /// Wait for the first playlist before responding.
    #[serde(default)]
    pub wait: bool,
    /// Overrides the configured ready timeout.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    #[serde(flatten)]
    pub stream: StreamInfo,
    /// Path of the HLS entry point on this server.
    pub playlist_url: String,
    /// Whether the first playlist was observed (only with `wait=true`).
    pub ready: bool,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub channel_id: String,
    pub running: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub channel_id: String,
    pub lines: Vec<String>,
}

async fn list_streams(State(state): State<AppState>) -> Json<Vec<StreamStatus>> {
    Json(state.supervisor.status_all().await)
}

async fn get_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StreamStatus>> {
    Ok(Json(state.supervisor.status(&id).await?))
}

async fn start_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StartQuery>,
) -> ApiResult<Json<StartResponse>> {
    let stream = state.supervisor.start(&id).await?;

    let ready = if query.wait {
        let timeout = query
            .timeout_secs
            .map(|secs| Duration::from_secs(secs.min(MAX_WAIT_SECS)))
            .unwrap_or(state.supervisor.config().ready_timeout);
        state.supervisor.await_ready(&id, timeout).await?;
        true
    } else {
        false
    };

    Ok(Json(StartResponse {
        playlist_url: hls_entry_path(&id),
        stream,
        ready,
    }))
}

async fn stop_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StopResponse>> {
    state.supervisor.stop(&id).await?;
    Ok(Json(StopResponse {
        channel_id: id,
        running: false,
    }))
}

async fn restart_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StartResponse>> {
    let stream = state.supervisor.restart(&id).await?;
    Ok(Json(StartResponse {
        playlist_url: hls_entry_path(&id),
        stream,
        ready: false,
    }))
}

async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES).min(MAX_LOG_LINES);
    let lines = state.supervisor.tail_log(&id, lines).await?;
    Ok(Json(LogsResponse {
        channel_id: id,
        lines,
    }))
}
