//! API route modules.
//!
//! Organizes routes by resource type.

pub mod channels;
pub mod health;
pub mod hls;
pub mod logging;
pub mod streams;

use axum::Router;

use crate::api::server::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest("/api/v1/channels", channels::router())
        .nest("/api/v1/streams", streams::router())
        .nest("/api/v1/logging", logging::router())
        .nest("/hls", hls::router())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request, StatusCode, header};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::catalog::{ChannelDescriptor, StaticCatalog};
    use crate::stream::{StreamSupervisor, SupervisorConfig};

    fn app(temp: &TempDir) -> Router {
        let catalog = StaticCatalog::new(vec![
            ChannelDescriptor::new("news1", "http://origin.test/news1.m3u8", "News One")
                .with_group("News"),
            ChannelDescriptor::new("music", "http://origin.test/music.m3u8", "Music"),
        ])
        .unwrap();
        let mut config = SupervisorConfig {
            output_root: temp.path().join("hls"),
            ..Default::default()
        };
        config.transcoder.binary_path = temp
            .path()
            .join("missing-ffmpeg")
            .to_string_lossy()
            .to_string();
        let supervisor = StreamSupervisor::new(Arc::new(catalog), config).unwrap();
        create_router(AppState::new(supervisor, "http://tv.local:8000"))
    }

    async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        send_request(app, request).await
    }

    async fn send_request(
        app: &Router,
        request: Request<Body>,
    ) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    #[tokio::test]
    async fn test_health() {
        let temp = TempDir::new().unwrap();
        let app = app(&temp);

        let (status, _, body) = send(&app, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["channels"], 2);
        assert_eq!(json["running"], 0);
    }

    #[tokio::test]
    async fn test_stream_status_routes() {
        let temp = TempDir::new().unwrap();
        let app = app(&temp);

        let (status, _, body) = send(&app, Method::GET, "/api/v1/streams").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 2);

        let (status, _, body) = send(&app, Method::GET, "/api/v1/streams/news1").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["running"], false);
        assert_eq!(json["monitor_state"], "stopped");

        let (status, _, body) = send(&app, Method::GET, "/api/v1/streams/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_stop_unknown_and_idle() {
        let temp = TempDir::new().unwrap();
        let app = app(&temp);

        let (status, _, _) = send(&app, Method::POST, "/api/v1/streams/nope/stop").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = send(&app, Method::POST, "/api/v1/streams/news1/stop").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_start_with_missing_binary_is_bad_gateway() {
        let temp = TempDir::new().unwrap();
        let app = app(&temp);

        let (status, _, body) = send(&app, Method::POST, "/api/v1/streams/news1/start").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "WORKER_LAUNCH_FAILED");

        let (status, _, body) = send(&app, Method::GET, "/api/v1/streams/news1/logs?lines=5").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(!json["lines"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_m3u_channel_list() {
        let temp = TempDir::new().unwrap();
        let app = app(&temp);

        let (status, headers, body) = send(&app, Method::GET, "/api/v1/channels/m3u").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "audio/x-mpegurl");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("#EXTM3U\n"));
        assert!(text.contains("http://tv.local:8000/hls/news1/index.m3u8"));
        assert!(text.contains("group-title=\"News\""));
    }

    #[tokio::test]
    async fn test_hls_playlist_passthrough() {
        let temp = TempDir::new().unwrap();
        let app = app(&temp);

        let (status, headers, _) = send(&app, Method::GET, "/hls/news1/index.m3u8").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(headers.contains_key(header::RETRY_AFTER));

        let dir = temp.path().join("hls").join("news1");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let playlist = "#EXTM3U\n#EXT-X-VERSION:3\n#EXTINF:4.000000,\nsegment_000000.ts\n";
        tokio::fs::write(dir.join("index.m3u8"), playlist).await.unwrap();
        tokio::fs::write(dir.join("segment_000000.ts"), b"\x47\x40\x00").await.unwrap();

        let (status, headers, body) = send(&app, Method::GET, "/hls/news1/index.m3u8").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/vnd.apple.mpegurl");
        assert_eq!(body, playlist.as_bytes());

        let (status, headers, body) = send(&app, Method::GET, "/hls/news1/segment_000000.ts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp2t");
        assert_eq!(body, b"\x47\x40\x00");

        // Reading the playlist must not start the channel.
        let (_, _, body) = send(&app, Method::GET, "/api/v1/streams/news1").await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["running"], false);
    }

    #[tokio::test]
    async fn test_hls_segment_range_and_conditional_requests() {
        let temp = TempDir::new().unwrap();
        let app = app(&temp);

        let dir = temp.path().join("hls").join("news1");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("segment_000003.ts"), b"\x47\x40\x00\x10").await.unwrap();

        let request = Request::builder()
            .uri("/hls/news1/segment_000003.ts")
            .header(header::RANGE, "bytes=1-2")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send_request(&app, request).await;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(body, b"\x40\x00");
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp2t");
        assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=60");

        let (status, headers, _) = send(&app, Method::GET, "/hls/news1/segment_000003.ts").await;
        assert_eq!(status, StatusCode::OK);
        let last_modified = headers[header::LAST_MODIFIED].clone();

        let request = Request::builder()
            .uri("/hls/news1/segment_000003.ts")
            .header(header::IF_MODIFIED_SINCE, last_modified)
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send_request(&app, request).await;
        assert_eq!(status, StatusCode::NOT_MODIFIED);
        assert!(body.is_empty());

        let (status, _, _) = send(&app, Method::GET, "/hls/news1/segment_000004.ts").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_hls_rejects_other_files() {
        let temp = TempDir::new().unwrap();
        let app = app(&temp);

        let (status, _, _) = send(&app, Method::GET, "/hls/news1/transcoder.log").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = send(&app, Method::GET, "/hls/nope/index.m3u8").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = send(&app, Method::GET, "/hls/news1/segment_000009.ts").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_logging_unavailable_without_config() {
        let temp = TempDir::new().unwrap();
        let app = app(&temp);

        let (status, _, _) = send(&app, Method::GET, "/api/v1/logging").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
