//! HLS output route: `/hls/{id}/{file}`.
//!
//! Serves only the playlist and segment files the transcoder writes, byte
//! for byte, with range and conditional request support. Reading a playlist
//! never starts a channel.

use axum::{
    Router,
    extract::{Path, Request, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::services::ServeFile;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::error::Error;
use crate::stream::PLAYLIST_FILE_NAME;
use crate::stream::worker::segment_index;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// Files a client may request from a channel's output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HlsFile {
    Playlist,
    Segment,
}

impl HlsFile {
    fn classify(file_name: &str) -> Option<Self> {
        if file_name == PLAYLIST_FILE_NAME {
            Some(Self::Playlist)
        } else if segment_index(file_name).is_some() {
            Some(Self::Segment)
        } else {
            None
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Self::Playlist => PLAYLIST_CONTENT_TYPE,
            Self::Segment => SEGMENT_CONTENT_TYPE,
        }
    }

    /// Playlists change every segment; segments never change once listed.
    fn cache_control(self) -> &'static str {
        match self {
            Self::Playlist => "no-cache",
            Self::Segment => "public, max-age=60",
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/{id}/{file}", get(serve_file))
}

async fn serve_file(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
    request: Request,
) -> ApiResult<Response> {
    let kind = HlsFile::classify(&file)
        .ok_or_else(|| ApiError::not_found(format!("No such HLS file: {}", file)))?;

    let path = match kind {
        HlsFile::Playlist => state.supervisor.resolve_playlist(&id).await?,
        HlsFile::Segment => state.supervisor.output_dir(&id)?.join(&file),
    };

    // Range and conditional requests are answered by `ServeFile`.
    let mut response = ServeFile::new(&path)
        .try_call(request)
        .await
        .map_err(|e| Error::io_path("reading HLS output", &path, e))?
        .into_response();

    if response.status() == StatusCode::NOT_FOUND {
        return Err(match kind {
            // Raced with the janitor or a restart; the player should retry.
            HlsFile::Playlist => Error::not_ready(&id).into(),
            HlsFile::Segment => ApiError::not_found(format!("Segment {} is gone", file)),
        });
    }

    let success = response.status().is_success();
    let headers = response.headers_mut();
    if success {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(kind.content_type()),
        );
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(kind.cache_control()),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(HlsFile::classify("index.m3u8"), Some(HlsFile::Playlist));
        assert_eq!(HlsFile::classify("segment_000012.ts"), Some(HlsFile::Segment));
        assert_eq!(HlsFile::classify("transcoder.log"), None);
        assert_eq!(HlsFile::classify("..%2Fsecret"), None);
        assert_eq!(HlsFile::classify("segment_1.ts.part"), None);
    }
}
