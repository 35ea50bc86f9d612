//! Configuration for the stream supervisor and its per-channel tasks.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::restart_tracker::RestartTrackerConfig;
use crate::{Error, Result};

/// The staleness threshold must cover this many segment durations.
const STALE_SEGMENT_FACTOR: u32 = 2;

/// How the external transcoder is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    /// Path to the ffmpeg binary.
    pub binary_path: String,
    /// Extra arguments placed before `-i`.
    pub input_args: Vec<String>,
    /// Extra arguments placed after `-c copy`.
    pub output_args: Vec<String>,
    /// User agent sent to the source.
    pub user_agent: Option<String>,
    /// ffmpeg `-loglevel`.
    pub log_level: String,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            input_args: vec![
                "-reconnect".to_string(),
                "1".to_string(),
                "-reconnect_streamed".to_string(),
                "1".to_string(),
                "-reconnect_delay_max".to_string(),
                "5".to_string(),
            ],
            output_args: Vec::new(),
            user_agent: Some("VLC/3.0.0".to_string()),
            log_level: "warning".to_string(),
        }
    }
}

/// Segment retention window of one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Target duration of a single segment in seconds.
    pub segment_duration_secs: u64,
    /// Number of segments listed in the published playlist.
    pub max_segments: usize,
    /// Extra segments kept on disk beyond the playlist window.
    pub safety_margin: usize,
    /// Segments younger than this are never deleted.
    pub min_segment_age: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            segment_duration_secs: 4,
            max_segments: 6,
            safety_margin: 2,
            min_segment_age: Duration::from_secs(30),
        }
    }
}

impl RetentionConfig {
    /// Number of segment files the janitor leaves in place.
    pub fn keep_count(&self) -> usize {
        self.max_segments + self.safety_margin
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_secs)
    }

    /// Seconds of media represented by `segment_count` segments.
    pub fn buffered_secs(&self, segment_count: usize) -> u64 {
        segment_count as u64 * self.segment_duration_secs
    }
}

/// Configuration for the stream supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Root directory; each channel writes to `<output_root>/<channel id>`.
    pub output_root: PathBuf,
    /// Transcoder invocation.
    pub transcoder: TranscoderConfig,
    /// Segment retention.
    pub retention: RetentionConfig,
    /// Health monitor polling interval.
    pub monitor_interval: Duration,
    /// Output older than `monitor_interval * stale_factor` marks a worker as stalled.
    pub stale_factor: u32,
    /// Backoff applied to monitor-driven restarts.
    pub restart: RestartTrackerConfig,
    /// Segment janitor interval.
    pub janitor_interval: Duration,
    /// Time a worker gets to exit after SIGTERM before it is killed.
    pub termination_grace: Duration,
    /// Time allowed for a killed worker to be reaped.
    pub kill_timeout: Duration,
    /// Default bound on waiting for the first playlist after a start.
    pub ready_timeout: Duration,
    /// Bound on joining background tasks during shutdown.
    pub shutdown_timeout: Duration,
    /// Lines of transcoder output kept in memory per channel.
    pub log_tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("./hls"),
            transcoder: TranscoderConfig::default(),
            retention: RetentionConfig::default(),
            monitor_interval: Duration::from_secs(5),
            stale_factor: 4,
            restart: RestartTrackerConfig::default(),
            janitor_interval: Duration::from_secs(10),
            termination_grace: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(20),
            shutdown_timeout: Duration::from_secs(15),
            log_tail_lines: 200,
        }
    }
}

impl SupervisorConfig {
    /// Staleness threshold for a running worker's playlist.
    pub fn stale_threshold(&self) -> Duration {
        self.monitor_interval.saturating_mul(self.stale_factor.max(1))
    }

    /// Output directory of a channel.
    pub fn channel_dir(&self, channel_id: &str) -> PathBuf {
        self.output_root.join(channel_id)
    }

    /// Reject values that would make the periodic tasks spin or the
    /// transcoder produce nothing.
    pub fn validate(&self) -> Result<()> {
        if self.transcoder.binary_path.trim().is_empty() {
            return Err(Error::config("transcoder binary path is empty"));
        }
        if self.retention.segment_duration_secs == 0 {
            return Err(Error::config("segment duration must be at least 1 second"));
        }
        if self.retention.max_segments == 0 {
            return Err(Error::config("max_segments must be at least 1"));
        }
        if self.monitor_interval.is_zero() || self.janitor_interval.is_zero() {
            return Err(Error::config("monitor and janitor intervals must be non-zero"));
        }
        // ffmpeg rewrites the playlist once per segment, and a segment can
        // run past its target duration until the next keyframe.
        let min_stale = self.retention.segment_duration().saturating_mul(STALE_SEGMENT_FACTOR);
        if self.stale_threshold() <= min_stale {
            return Err(Error::config(format!(
                "staleness threshold {:?} (monitor_interval x stale_factor) must exceed {:?} \
                 ({} x segment duration)",
                self.stale_threshold(),
                min_stale,
                STALE_SEGMENT_FACTOR
            )));
        }
        if self.log_tail_lines == 0 {
            return Err(Error::config("log_tail_lines must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SupervisorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stale_threshold(), Duration::from_secs(20));
        assert_eq!(config.retention.keep_count(), 8);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = SupervisorConfig::default();
        config.retention.max_segments = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = SupervisorConfig::default();
        config.monitor_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_threshold_shorter_than_segments() {
        // 5s x 4 = 20s threshold against 30s segments: every healthy worker
        // would look stalled between playlist rewrites.
        let mut config = SupervisorConfig::default();
        config.retention.segment_duration_secs = 30;
        assert!(matches!(config.validate(), Err(Error::Configuration(ref msg)) if msg.contains("stale")));

        let mut config = SupervisorConfig {
            monitor_interval: Duration::from_millis(300),
            stale_factor: 3,
            ..Default::default()
        };
        config.retention.segment_duration_secs = 2;
        assert!(config.validate().is_err());

        // Exactly two segment durations is still too tight.
        config.retention.segment_duration_secs = 1;
        config.monitor_interval = Duration::from_millis(500);
        config.stale_factor = 4;
        assert!(config.validate().is_err());

        config.stale_factor = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_buffered_secs() {
        let retention = RetentionConfig {
            segment_duration_secs: 4,
            ..Default::default()
        };
        assert_eq!(retention.buffered_secs(5), 20);
        assert_eq!(retention.buffered_secs(0), 0);
    }

    #[test]
    fn test_channel_dir() {
        let config = SupervisorConfig {
            output_root: PathBuf::from("/var/hls"),
            ..Default::default()
        };
        assert_eq!(config.channel_dir("news1"), PathBuf::from("/var/hls/news1"));
    }
}
