//! Log filter routes.

use axum::{Json, Router, extract::State, routing::get};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::logging::{LogFilter, LoggingConfig};

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_filter).put(set_filter))
}

fn logging(state: &AppState) -> ApiResult<&LoggingConfig> {
    state.logging_config.as_deref().ok_or_else(|| {
        ApiError::service_unavailable("LOGGING_UNAVAILABLE", "Logging is not configured")
    })
}

async fn get_filter(State(state): State<AppState>) -> ApiResult<Json<LogFilter>> {
    Ok(Json(LogFilter {
        filter: logging(&state)?.get_filter(),
    }))
}

/// Replace the active filter, e.g. `{"filter": "restream=debug"}`.
async fn set_filter(
    State(state): State<AppState>,
    Json(body): Json<LogFilter>,
) -> ApiResult<Json<LogFilter>> {
    let logging = logging(&state)?;
    logging.set_filter(&body.filter)?;
    Ok(Json(LogFilter {
        filter: logging.get_filter(),
    }))
}
