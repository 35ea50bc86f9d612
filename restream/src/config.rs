//! Application configuration.
//!
//! Defaults come from `Default` impls; environment variables override them.
//! `main` loads a `.env` file first, so the same keys work there.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `RESTREAM_OUTPUT_DIR` | HLS output root |
//! | `RESTREAM_FFMPEG_PATH` | transcoder binary |
//! | `RESTREAM_USER_AGENT` | user agent sent to sources (empty disables) |
//! | `RESTREAM_SEGMENT_SECS` | segment duration |
//! | `RESTREAM_MAX_SEGMENTS` | playlist length |
//! | `RESTREAM_SAFETY_MARGIN` | extra segments kept on disk |
//! | `RESTREAM_MIN_SEGMENT_AGE_SECS` | janitor minimum age |
//! | `RESTREAM_MONITOR_INTERVAL_SECS` | health check interval |
//! | `RESTREAM_STALE_FACTOR` | staleness threshold multiplier |
//! | `RESTREAM_JANITOR_INTERVAL_SECS` | janitor interval |
//! | `RESTREAM_TERMINATION_GRACE_SECS` | SIGTERM grace period |
//! | `RESTREAM_READY_TIMEOUT_SECS` | default wait for the first playlist |
//! | `RESTREAM_CHANNELS_FILE` | JSON channel catalog |
//! | `RESTREAM_LOG_DIR` | application log directory |
//! | `RESTREAM_PUBLIC_BASE_URL` | base URL in the M3U channel list |
//! | `API_BIND_ADDRESS`, `API_PORT` | HTTP listener |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::ApiServerConfig;
use crate::stream::SupervisorConfig;
use crate::{Error, Result};

/// Everything `main` needs to run the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub supervisor: SupervisorConfig,
    pub api: ApiServerConfig,
    pub channels_file: PathBuf,
    pub log_dir: PathBuf,
    /// Base URL players use to reach this server.
    pub public_base_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let api = ApiServerConfig::default();
        let public_base_url = format!("http://localhost:{}", api.port);
        Self {
            supervisor: SupervisorConfig::default(),
            api,
            channels_file: PathBuf::from("channels.json"),
            log_dir: PathBuf::from("logs"),
            public_base_url,
        }
    }
}

impl AppConfig {
    /// Load config from environment variables, falling back to defaults.
    pub fn from_env_or_default() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self {
            api: ApiServerConfig::from_lookup(&lookup),
            ..Self::default()
        };
        config.public_base_url = format!("http://localhost:{}", config.api.port);

        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let supervisor = &mut config.supervisor;

        if let Some(dir) = get("RESTREAM_OUTPUT_DIR") {
            supervisor.output_root = PathBuf::from(dir);
        }
        if let Some(path) = get("RESTREAM_FFMPEG_PATH") {
            supervisor.transcoder.binary_path = path;
        }
        if let Some(ua) = lookup("RESTREAM_USER_AGENT") {
            supervisor.transcoder.user_agent = (!ua.trim().is_empty()).then_some(ua);
        }
        if let Some(v) = parse(&get, "RESTREAM_SEGMENT_SECS")? {
            supervisor.retention.segment_duration_secs = v;
        }
        if let Some(v) = parse(&get, "RESTREAM_MAX_SEGMENTS")? {
            supervisor.retention.max_segments = v;
        }
        if let Some(v) = parse(&get, "RESTREAM_SAFETY_MARGIN")? {
            supervisor.retention.safety_margin = v;
        }
        if let Some(v) = parse(&get, "RESTREAM_MIN_SEGMENT_AGE_SECS")? {
            supervisor.retention.min_segment_age = Duration::from_secs(v);
        }
        if let Some(v) = parse(&get, "RESTREAM_MONITOR_INTERVAL_SECS")? {
            supervisor.monitor_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse(&get, "RESTREAM_STALE_FACTOR")? {
            supervisor.stale_factor = v;
        }
        if let Some(v) = parse(&get, "RESTREAM_JANITOR_INTERVAL_SECS")? {
            supervisor.janitor_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse(&get, "RESTREAM_TERMINATION_GRACE_SECS")? {
            supervisor.termination_grace = Duration::from_secs(v);
        }
        if let Some(v) = parse(&get, "RESTREAM_READY_TIMEOUT_SECS")? {
            supervisor.ready_timeout = Duration::from_secs(v);
        }

        if let Some(path) = get("RESTREAM_CHANNELS_FILE") {
            config.channels_file = PathBuf::from(path);
        }
        if let Some(dir) = get("RESTREAM_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(url) = get("RESTREAM_PUBLIC_BASE_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }

        config.supervisor.validate()?;
        Ok(config)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::config(format!("{}: invalid value '{}': {}", key, raw, e)))
        })
        .transpose()
}
