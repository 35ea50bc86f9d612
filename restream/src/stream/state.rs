//! Status types reported by the supervisor.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::worker::{TerminationOutcome, WorkerProbe};

/// Health monitor state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Watching,
    RestartPending,
    #[default]
    Stopped,
}

/// Why a worker was (or is about to be) restarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestartReason {
    /// The transcoder exited on its own.
    ProcessExited { code: Option<i32> },
    /// The transcoder is alive but the playlist stopped advancing.
    StalledOutput { stale_ms: u64 },
    /// The channel should be running but has no worker (a respawn failed).
    WorkerMissing,
    /// An operator asked for it.
    Manual,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProcessExited { code: Some(code) } => {
                write!(f, "transcoder exited with code {}", code)
            }
            Self::ProcessExited { code: None } => write!(f, "transcoder was killed by a signal"),
            Self::StalledOutput { stale_ms } => {
                write!(f, "playlist has not advanced for {:.1}s", *stale_ms as f64 / 1000.0)
            }
            Self::WorkerMissing => write!(f, "no transcoder registered"),
            Self::Manual => write!(f, "manual restart"),
        }
    }
}

/// Last restart of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartRecord {
    pub reason: RestartReason,
    pub at: DateTime<Utc>,
}

/// Supervisor-maintained view of a channel, read without taking lifecycle locks.
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamSnapshot {
    /// Session the fields below belong to; `None` once stopped.
    pub session_id: Option<u64>,
    pub probe: Option<WorkerProbe>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub monitor_state: MonitorState,
    pub last_restart: Option<RestartRecord>,
    pub restart_count: u64,
    pub last_error: Option<String>,
}

/// Result of `start`: what a caller needs to serve the channel.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub channel_id: String,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub output_dir: PathBuf,
    pub playlist_path: PathBuf,
    pub segment_duration_secs: u64,
    pub max_segments: usize,
    /// False when the call found the channel already running.
    pub launched: bool,
}

/// Status report of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub channel_id: String,
    pub running: bool,
    /// Worker alive and its output advancing.
    pub process_healthy: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub segment_count: usize,
    pub output_path_exists: bool,
    /// `segment_count * segment_duration`.
    pub buffered_secs: u64,
    pub output_dir: PathBuf,
    pub playlist_path: PathBuf,
    pub monitor_state: MonitorState,
    pub last_restart: Option<RestartRecord>,
    pub restart_count: u64,
    pub last_error: Option<String>,
}

/// Outcome of stopping one channel during shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelShutdown {
    pub channel_id: String,
    pub outcome: Option<TerminationOutcome>,
    pub error: Option<String>,
}

/// Report returned by `StreamSupervisor::shutdown`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Channels that had a worker when shutdown began.
    pub stopped: Vec<ChannelShutdown>,
    /// Whether every background task finished within the bound.
    pub tasks_joined: bool,
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Channels whose worker could not be confirmed dead.
    pub fn failures(&self) -> impl Iterator<Item = &ChannelShutdown> {
        self.stopped.iter().filter(|c| c.error.is_some())
    }

    pub fn is_clean(&self) -> bool {
        self.tasks_joined && self.failures().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_reason_serializes_with_kind() {
        let json = serde_json::to_value(RestartReason::StalledOutput { stale_ms: 21_500 }).unwrap();
        assert_eq!(json["kind"], "stalled_output");
        assert_eq!(json["stale_ms"], 21_500);

        let json = serde_json::to_value(MonitorState::RestartPending).unwrap();
        assert_eq!(json, "restart_pending");
    }

    #[test]
    fn test_restart_reason_display() {
        assert_eq!(
            RestartReason::ProcessExited { code: Some(1) }.to_string(),
            "transcoder exited with code 1"
        );
        assert_eq!(RestartReason::WorkerMissing.to_string(), "no transcoder registered");
    }

    #[test]
    fn test_shutdown_report_clean() {
        let mut report = ShutdownReport {
            tasks_joined: true,
            ..Default::default()
        };
        assert!(report.is_clean());

        report.stopped.push(ChannelShutdown {
            channel_id: "news1".to_string(),
            outcome: None,
            error: Some("timed out".to_string()),
        });
        assert!(!report.is_clean());
        assert_eq!(report.failures().count(), 1);
    }
}
