//! Catalog routes.

use axum::{
    Json, Router,
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
};

use crate::api::server::AppState;
use crate::catalog::{ChannelDescriptor, m3u};

/// Content type of an M3U channel list.
const M3U_CONTENT_TYPE: &str = "audio/x-mpegurl";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_channels))
        .route("/m3u", get(channel_playlist))
}

async fn list_channels(State(state): State<AppState>) -> Json<Vec<ChannelDescriptor>> {
    Json(state.supervisor.catalog().list_all())
}

/// Extended M3U pointing every channel at its local HLS entry point.
async fn channel_playlist(State(state): State<AppState>) -> impl IntoResponse {
    let channels = state.supervisor.catalog().list_all();
    let body = m3u::render_playlist(&channels, &state.public_base_url);
    ([(header::CONTENT_TYPE, M3U_CONTENT_TYPE)], body)
}
