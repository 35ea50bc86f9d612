//! Per-channel stream supervision.
//!
//! One `ProcessWorker` (ffmpeg) per channel, watched by a `HealthMonitor`
//! and trimmed by a `SegmentJanitor`, all owned by the `StreamSupervisor`.

pub mod config;
pub mod janitor;
pub mod log_sink;
pub mod monitor;
pub mod restart_tracker;
pub mod state;
pub mod supervisor;
pub mod worker;

pub use config::{RetentionConfig, SupervisorConfig, TranscoderConfig};
pub use restart_tracker::RestartTrackerConfig;
pub use state::{
    ChannelShutdown, MonitorState, RestartReason, RestartRecord, ShutdownReport, StreamInfo,
    StreamStatus,
};
pub use supervisor::StreamSupervisor;
pub use worker::{PLAYLIST_FILE_NAME, TerminationOutcome};
