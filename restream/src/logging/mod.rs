//! Application logging.
//!
//! Console and a daily file in the log directory share one filter that the
//! API can swap at runtime. Rotated files older than a week are pruned.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::utils::fs;
use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "restream=info,tower_http=info";

/// File name prefix of the daily application log (`restream.log.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "restream.log";

/// Log retention period in days.
const LOG_RETENTION_DAYS: i64 = 7;

/// How often old log files are looked for.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Timer that formats timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Current filter, as reported by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFilter {
    pub filter: String,
}

/// Runtime control over the installed subscriber.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_dir: PathBuf,
}

impl LoggingConfig {
    /// The directive string currently in force.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(ToString::to_string)
            .unwrap_or_default()
    }

    /// Swap in a new directive such as `restream=debug,tower_http=warn`.
    ///
    /// An unparsable directive leaves the current filter untouched.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("bad log filter '{}': {}", directive, e)))?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::Other(format!("log filter reload failed: {}", e)))?;
        info!(%directive, "Log filter changed");
        Ok(())
    }

    /// Prune old application logs now, then once a day until `token` fires.
    pub fn start_retention_cleanup(self: &Arc<Self>, token: CancellationToken) {
        let log_dir = self.log_dir.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let today = Local::now().date_naive();
                        match cleanup_old_logs(&log_dir, today, LOG_RETENTION_DAYS).await {
                            Ok(0) => {}
                            Ok(n) => info!(deleted = n, dir = %log_dir.display(), "Pruned old log files"),
                            Err(e) => warn!(error = %e, dir = %log_dir.display(), "Log pruning failed"),
                        }
                    }
                }
            }
            debug!("Log retention task stopped");
        });
    }
}

/// Date of a rotated application log, parsed from its file name.
fn log_file_date(file_name: &str) -> Option<NaiveDate> {
    let date = file_name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_prefix('.')?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Whether a log dated `date` has outlived `retention_days` as of `today`.
fn is_expired(date: NaiveDate, today: NaiveDate, retention_days: i64) -> bool {
    (today - date).num_days() > retention_days
}

/// Remove rotated application logs past retention. Other files are ignored.
async fn cleanup_old_logs(
    log_dir: &Path,
    today: NaiveDate,
    retention_days: i64,
) -> std::io::Result<usize> {
    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let expired = name
            .to_str()
            .and_then(log_file_date)
            .is_some_and(|date| is_expired(date, today, retention_days));
        if !expired {
            continue;
        }

        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                removed += 1;
                debug!(path = %path.display(), "Removed expired log");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Could not remove expired log"),
        }
    }

    Ok(removed)
}

/// Install the global subscriber: console plus a daily file in `log_dir`.
///
/// `RUST_LOG` wins over [`DEFAULT_LOG_FILTER`]. The returned guard flushes
/// the file writer when dropped, so `main` holds it until exit.
pub fn init_logging(log_dir: &Path) -> Result<(Arc<LoggingConfig>, WorkerGuard)> {
    fs::ensure_dir_all_sync_with_op("creating log directory", log_dir)?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter, handle) = reload::Layer::new(filter);

    let console = fmt::layer().with_timer(LocalTimer);
    let file = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_timer(LocalTimer)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Other(format!("tracing subscriber already installed: {}", e)))?;

    Ok((
        Arc::new(LoggingConfig {
            handle,
            log_dir: log_dir.to_path_buf(),
        }),
        guard,
    ))
}
