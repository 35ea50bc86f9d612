//! Health check route.

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::api::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub channels: usize,
    pub running: usize,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

/// Liveness plus a channel summary. Never takes a channel lock.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let statuses = state.supervisor.status_all().await;
    let status = if state.supervisor.is_shutting_down() {
        "shutting_down"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        channels: statuses.len(),
        running: statuses.iter().filter(|s| s.running).count(),
    })
}
