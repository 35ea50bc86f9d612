//! Application-wide error types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Failed to launch transcoder for channel {channel_id}: {reason}")]
    WorkerLaunchFailed { channel_id: String, reason: String },

    #[error("Transcoder for channel {channel_id} is unresponsive: {reason}")]
    WorkerUnresponsive { channel_id: String, reason: String },

    #[error("Output for channel {channel_id} is not ready yet")]
    OutputNotReady { channel_id: String },

    #[error("Transcoder for channel {channel_id} (pid {pid:?}) did not exit within {waited:?}")]
    TerminationTimeout {
        channel_id: String,
        pid: Option<u32>,
        waited: Duration,
    },

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} ({path}): {source}")]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn channel_not_found(id: impl Into<String>) -> Self {
        Self::ChannelNotFound(id.into())
    }

    pub fn launch_failed(channel_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WorkerLaunchFailed {
            channel_id: channel_id.into(),
            reason: reason.into(),
        }
    }

    pub fn not_ready(channel_id: impl Into<String>) -> Self {
        Self::OutputNotReady {
            channel_id: channel_id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the caller should try again shortly rather than treat the
    /// condition as permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OutputNotReady { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::not_ready("news1").is_retryable());
        assert!(!Error::channel_not_found("news1").is_retryable());
        assert!(!Error::launch_failed("news1", "missing binary").is_retryable());
    }

    #[test]
    fn test_io_path_message() {
        let err = Error::io_path(
            "creating output directory",
            Path::new("/tmp/hls/news1"),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        let msg = err.to_string();
        assert!(msg.contains("creating output directory"));
        assert!(msg.contains("/tmp/hls/news1"));
    }
}
