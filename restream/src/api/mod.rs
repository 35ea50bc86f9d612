//! HTTP layer.
//!
//! Thin, stateless handlers over `StreamSupervisor`: control and status
//! under `/api/v1`, channel lists for players, and the HLS output itself
//! under `/hls`.

pub mod error;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{ApiServer, ApiServerConfig, AppState};
