//! Panic logging.
//!
//! A panic inside a request handler or a channel task is contained by tokio,
//! but it should still leave a trace in the application log.

use std::backtrace::Backtrace;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{PanicHookInfo, take_hook};
use std::path::{Path, PathBuf};
use std::thread;

use chrono::Local;

use crate::logging::LOG_FILE_PREFIX;

/// What gets logged for one panic.
#[derive(Debug)]
struct PanicRecord {
    timestamp: String,
    thread: String,
    location: String,
    payload: String,
    backtrace: String,
}

impl PanicRecord {
    fn capture(panic_info: &PanicHookInfo<'_>) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string(),
            thread: thread::current()
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| "<unnamed>".to_string()),
            location: panic_info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: payload_to_string(panic_info),
            backtrace: Backtrace::force_capture().to_string(),
        }
    }
}

impl fmt::Display for PanicRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} PANIC thread={} location={} payload={}\nBacktrace:\n{}",
            self.timestamp, self.thread, self.location, self.payload, self.backtrace
        )
    }
}

/// Install a global panic hook that logs through `tracing`, then chains to
/// the previous hook.
///
/// In `panic = "abort"` builds the record is also appended straight to the
/// current daily log file in `log_dir`; the non-blocking writer may not
/// flush before the process aborts.
pub fn install(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref().to_path_buf();
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = PanicRecord::capture(panic_info);
            tracing::error!(target: "restream::panic", "{record}");

            if cfg!(panic = "abort") {
                let _ = append_to_daily_log(&log_dir, &record);
            }
        }));

        previous_hook(panic_info);
    }));
}

/// Same file name `tracing_appender::rolling::daily` would use today.
fn daily_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(format!(
        "{}.{}",
        LOG_FILE_PREFIX,
        Local::now().format("%Y-%m-%d")
    ))
}

fn append_to_daily_log(log_dir: &Path, record: &PanicRecord) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(daily_log_path(log_dir))?;
    writeln!(file, "{record}")?;
    file.flush()
}

fn payload_to_string(panic_info: &PanicHookInfo<'_>) -> String {
    let payload = panic_info.payload();
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    panic_info.to_string()
}
