//! HTTP listener, shared handler state and middleware.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::Request;
use axum::http::Response;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{Span, info};

use crate::api::routes;
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use crate::stream::StreamSupervisor;

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Allow any origin, so browser players on other hosts can fetch playlists.
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            enable_cors: true,
        }
    }
}

impl ApiServerConfig {
    /// Read `API_BIND_ADDRESS` and `API_PORT`. Blank or unparsable values keep the default.
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("API_BIND_ADDRESS").filter(|v| !v.trim().is_empty()) {
            config.bind_address = addr.trim().to_string();
        }
        if let Some(port) = lookup("API_PORT").and_then(|v| v.trim().parse::<u16>().ok()) {
            config.port = port;
        }
        config
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| Error::config(format!("invalid API listen address: {}", e)))
    }
}

/// State handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub supervisor: StreamSupervisor,
    /// Base URL written into the M3U channel list.
    pub public_base_url: String,
    /// Absent in tests; the logging routes then answer 503.
    pub logging_config: Option<Arc<LoggingConfig>>,
}

impl AppState {
    pub fn new(supervisor: StreamSupervisor, public_base_url: impl Into<String>) -> Self {
        Self {
            start_time: Instant::now(),
            supervisor,
            public_base_url: public_base_url.into(),
            logging_config: None,
        }
    }

    pub fn with_logging_config(mut self, config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(config);
        self
    }
}

/// The HTTP front end: control API plus HLS file serving.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops `run` after in-flight requests finish.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Routes plus CORS and request tracing.
    pub fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        // Players poll playlists and segments constantly; only API calls get a span.
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let path = req.uri().path();
                    if is_quiet_path(path) {
                        return Span::none();
                    }
                    tracing::info_span!("http", method = %req.method(), path = %path)
                })
                .on_request(())
                .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                    if !span.is_disabled() {
                        tracing::info!(
                            parent: span,
                            status = res.status().as_u16(),
                            latency_ms = latency.as_millis() as u64,
                            "Request finished"
                        );
                    }
                })
                .on_failure(
                    |class: ServerErrorsFailureClass, latency: Duration, span: &Span| {
                        if !span.is_disabled() {
                            tracing::error!(
                                parent: span,
                                %class,
                                latency_ms = latency.as_millis() as u64,
                                "Request failed"
                            );
                        }
                    },
                ),
        )
    }

    /// Serve until the cancellation token fires.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::config(format!("cannot bind {}: {}", addr, e)))?;
        info!(%addr, "API server listening");

        let token = self.cancel_token.clone();
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move {
                token.cancelled().await;
                info!("API server draining connections");
            })
            .await
            .map_err(|e| Error::Other(format!("API server failed: {}", e)))
    }
}

fn is_quiet_path(path: &str) -> bool {
    path.starts_with("/health") || path.starts_with("/hls/")
}
