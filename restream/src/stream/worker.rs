//! ffmpeg worker process for one channel.
//!
//! A `ProcessWorker` wraps a single transcoder invocation. The child process
//! is owned by a waiter task that reports its exit through a watch channel,
//! so liveness checks never block and termination is always bounded.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::config::SupervisorConfig;
use super::log_sink::LogSink;
use crate::catalog::ChannelDescriptor;
use crate::utils::fs::{ensure_dir_all_with_op, modified_at};
use crate::{Error, Result};

/// Playlist written by the transcoder; the channel's HLS entry point.
pub const PLAYLIST_FILE_NAME: &str = "index.m3u8";

/// Segment files are `segment_<index>.ts`.
pub const SEGMENT_PREFIX: &str = "segment_";
pub const SEGMENT_EXTENSION: &str = "ts";

/// Slack on top of grace + kill timeout before giving up on the waiter task.
const WAITER_SLACK: Duration = Duration::from_millis(500);

/// How a worker ended when it was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// The process had already exited on its own.
    AlreadyExited,
    /// The process exited after SIGTERM within the grace period.
    Graceful,
    /// The process had to be killed.
    Forced,
}

/// Exit details of a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub at: DateTime<Utc>,
}

/// Parse the index of a segment file name such as `segment_000042.ts`.
pub fn segment_index(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

/// First segment number for a new worker: one past the highest existing index.
///
/// Keeps a restarted worker from overwriting segments that the previous
/// run's playlist may still reference.
pub async fn next_segment_number(output_dir: &Path) -> u64 {
    let Ok(mut entries) = tokio::fs::read_dir(output_dir).await else {
        return 0;
    };

    let mut next = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(index) = entry.file_name().to_str().and_then(segment_index) {
            next = next.max(index + 1);
        }
    }
    next
}

/// Build the ffmpeg arguments for a channel.
pub fn build_args(
    channel: &ChannelDescriptor,
    config: &SupervisorConfig,
    output_dir: &Path,
    start_number: u64,
) -> Vec<String> {
    let transcoder = &config.transcoder;
    let retention = &config.retention;
    let mut args = Vec::new();

    args.extend([
        "-hide_banner".to_string(),
        "-nostdin".to_string(),
        "-loglevel".to_string(),
        transcoder.log_level.clone(),
        "-y".to_string(),
    ]);

    args.extend(transcoder.input_args.iter().cloned());

    if let Some(ref ua) = transcoder.user_agent {
        args.extend(["-user_agent".to_string(), ua.clone()]);
    }

    args.extend(["-i".to_string(), channel.source_url.clone()]);

    // Passthrough, no re-encode.
    args.extend(["-c".to_string(), "copy".to_string()]);

    args.extend(transcoder.output_args.iter().cloned());

    let segment_pattern = output_dir.join(format!(
        "{}%06d.{}",
        SEGMENT_PREFIX, SEGMENT_EXTENSION
    ));
    args.extend([
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        retention.segment_duration_secs.to_string(),
        "-hls_list_size".to_string(),
        retention.max_segments.to_string(),
        "-hls_flags".to_string(),
        "independent_segments+omit_endlist".to_string(),
        "-start_number".to_string(),
        start_number.to_string(),
        "-hls_segment_filename".to_string(),
        segment_pattern.to_string_lossy().to_string(),
    ]);

    args.push(
        output_dir
            .join(PLAYLIST_FILE_NAME)
            .to_string_lossy()
            .to_string(),
    );

    args
}

/// Read-only view of a worker handed to background tasks.
#[derive(Debug, Clone)]
pub struct WorkerProbe {
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    playlist_path: PathBuf,
    started_at: SystemTime,
}

impl WorkerProbe {
    /// Non-blocking liveness check.
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Modification time of the channel's playlist.
    pub async fn last_output_modified_at(&self) -> Option<SystemTime> {
        modified_at(&self.playlist_path).await
    }

    /// Most recent sign of progress: the playlist mtime, or the start time
    /// if this worker has not rewritten the playlist yet.
    pub async fn last_progress_at(&self) -> SystemTime {
        match self.last_output_modified_at().await {
            Some(modified) if modified > self.started_at => modified,
            _ => self.started_at,
        }
    }
}

/// A running (or exited) transcoder for one channel.
pub struct ProcessWorker {
    channel_id: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    probe: WorkerProbe,
    stop_token: CancellationToken,
    waiter: Option<JoinHandle<Result<TerminationOutcome>>>,
    grace: Duration,
    kill_timeout: Duration,
}

impl ProcessWorker {
    /// Launch the transcoder for `channel`.
    ///
    /// Creates the output directory, spawns ffmpeg with its stderr routed to
    /// `sink`, and registers the waiter and log tasks on `tasks`.
    pub async fn spawn(
        channel: &ChannelDescriptor,
        config: &SupervisorConfig,
        sink: &LogSink,
        tasks: &TaskTracker,
    ) -> Result<Self> {
        let output_dir = config.channel_dir(&channel.id);
        ensure_dir_all_with_op("creating output directory", &output_dir).await?;

        let start_number = next_segment_number(&output_dir).await;
        let args = build_args(channel, config, &output_dir, start_number);

        debug!(
            channel_id = %channel.id,
            "Spawning {} with args: {:?}", config.transcoder.binary_path, args
        );

        let started_wall = SystemTime::now();
        let mut child = process_utils::tokio_command(&config.transcoder.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::launch_failed(
                    &channel.id,
                    format!("failed to spawn {}: {}", config.transcoder.binary_path, e),
                )
            })?;

        let pid = child.id();
        if let Some(stderr) = child.stderr.take() {
            tasks.spawn(sink.clone().pump(stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let stop_token = CancellationToken::new();
        let waiter = tasks.spawn(supervise_child(
            child,
            channel.id.clone(),
            stop_token.clone(),
            exit_tx,
            config.termination_grace,
            config.kill_timeout,
        ));

        info!(
            channel_id = %channel.id,
            pid = ?pid,
            start_number,
            output_dir = %output_dir.display(),
            "Transcoder started"
        );

        let playlist_path = output_dir.join(PLAYLIST_FILE_NAME);
        Ok(Self {
            channel_id: channel.id.clone(),
            pid,
            started_at: DateTime::<Utc>::from(started_wall),
            probe: WorkerProbe {
                exit_rx,
                playlist_path,
                started_at: started_wall,
            },
            stop_token,
            waiter: Some(waiter),
            grace: config.termination_grace,
            kill_timeout: config.kill_timeout,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_alive(&self) -> bool {
        self.probe.is_alive()
    }

    pub fn probe(&self) -> WorkerProbe {
        self.probe.clone()
    }

    /// Stop the process: SIGTERM, then a hard kill after the grace period.
    ///
    /// Never waits longer than grace + kill timeout (plus a little slack).
    pub async fn terminate(&mut self) -> Result<TerminationOutcome> {
        self.stop_token.cancel();

        let Some(waiter) = self.waiter.take() else {
            return Ok(TerminationOutcome::AlreadyExited);
        };

        let bound = self.grace + self.kill_timeout + WAITER_SLACK;
        match tokio::time::timeout(bound, waiter).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(Error::Other(format!(
                "transcoder waiter for channel {} failed: {}",
                self.channel_id, join_error
            ))),
            Err(_) => Err(Error::TerminationTimeout {
                channel_id: self.channel_id.clone(),
                pid: self.pid,
                waited: bound,
            }),
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        // The waiter owns the child; cancelling makes it terminate and reap.
        self.stop_token.cancel();
    }
}

/// Own the child until it exits, terminating it when `stop` fires.
async fn supervise_child(
    mut child: Child,
    channel_id: String,
    stop: CancellationToken,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    grace: Duration,
    kill_timeout: Duration,
) -> Result<TerminationOutcome> {
    let publish_exit = |status: std::io::Result<std::process::ExitStatus>| {
        let code = match status {
            Ok(status) => status.code(),
            Err(ref e) => {
                error!(channel_id = %channel_id, error = %e, "Error waiting for transcoder");
                None
            }
        };
        exit_tx.send_replace(Some(ExitInfo {
            code,
            at: Utc::now(),
        }));
        code
    };

    tokio::select! {
        status = child.wait() => {
            let code = publish_exit(status);
            warn!(channel_id = %channel_id, code = ?code, "Transcoder exited");
            return Ok(TerminationOutcome::AlreadyExited);
        }
        _ = stop.cancelled() => {}
    }

    let pid = child.id();
    let signalled = match pid.map(process_utils::request_terminate) {
        Some(Ok(delivered)) => delivered,
        Some(Err(e)) => {
            warn!(channel_id = %channel_id, pid = ?pid, error = %e, "Failed to signal transcoder");
            false
        }
        None => false,
    };

    if signalled {
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            let code = publish_exit(status);
            debug!(channel_id = %channel_id, code = ?code, "Transcoder exited gracefully");
            return Ok(TerminationOutcome::Graceful);
        }

        let timeout_error = Error::TerminationTimeout {
            channel_id: channel_id.clone(),
            pid,
            waited: grace,
        };
        warn!("{}, killing", timeout_error);
    }

    if let Err(e) = child.start_kill() {
        debug!(channel_id = %channel_id, error = %e, "Kill failed, process may have exited");
    }

    match tokio::time::timeout(kill_timeout, child.wait()).await {
        Ok(status) => {
            publish_exit(status);
            Ok(TerminationOutcome::Forced)
        }
        Err(_) => {
            let err = Error::TerminationTimeout {
                channel_id: channel_id.clone(),
                pid,
                waited: grace + kill_timeout,
            };
            error!("{}", err);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn channel() -> ChannelDescriptor {
        ChannelDescriptor::new("news1", "http://origin.test/news1/master.m3u8", "News One")
    }

    #[test]
    fn test_segment_index() {
        assert_eq!(segment_index("segment_000042.ts"), Some(42));
        assert_eq!(segment_index("segment_7.ts"), Some(7));
        assert_eq!(segment_index("segment_.ts"), None);
        assert_eq!(segment_index("index.m3u8"), None);
        assert_eq!(segment_index("segment_000001.ts.tmp"), None);
    }

    #[test]
    fn test_build_args() {
        let config = SupervisorConfig::default();
        let dir = PathBuf::from("/var/hls/news1");
        let args = build_args(&channel(), &config, &dir, 17);

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("-i") + 1], "http://origin.test/news1/master.m3u8");
        assert_eq!(args[pos("-c") + 1], "copy");
        assert_eq!(args[pos("-f") + 1], "hls");
        assert_eq!(args[pos("-hls_time") + 1], "4");
        assert_eq!(args[pos("-hls_list_size") + 1], "6");
        assert_eq!(args[pos("-start_number") + 1], "17");
        assert_eq!(
            args[pos("-hls_segment_filename") + 1],
            "/var/hls/news1/segment_%06d.ts"
        );
        assert_eq!(args.last().unwrap(), "/var/hls/news1/index.m3u8");
        assert!(pos("-user_agent") < pos("-i"));
    }

    #[tokio::test]
    async fn test_next_segment_number() {
        let temp = TempDir::new().unwrap();
        assert_eq!(next_segment_number(temp.path()).await, 0);
        assert_eq!(next_segment_number(&temp.path().join("missing")).await, 0);

        for name in ["segment_000003.ts", "segment_000011.ts", "index.m3u8"] {
            tokio::fs::write(temp.path().join(name), b"x").await.unwrap();
        }
        assert_eq!(next_segment_number(temp.path()).await, 12);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let temp = TempDir::new().unwrap();
        let mut config = SupervisorConfig {
            output_root: temp.path().to_path_buf(),
            ..Default::default()
        };
        config.transcoder.binary_path = temp
            .path()
            .join("no-such-ffmpeg")
            .to_string_lossy()
            .to_string();

        let sink = LogSink::new("news1", &config.channel_dir("news1"), 8);
        let tasks = TaskTracker::new();
        let result = ProcessWorker::spawn(&channel(), &config, &sink, &tasks).await;

        assert!(matches!(result, Err(Error::WorkerLaunchFailed { .. })));
        assert!(config.channel_dir("news1").is_dir());
    }

    /// Config whose transcoder is a shell script with `body`, ignoring ffmpeg's arguments.
    #[cfg(unix)]
    async fn scripted_config(temp: &TempDir, body: &str, grace: Duration) -> SupervisorConfig {
        use std::os::unix::fs::PermissionsExt;

        let script = temp.path().join("fake-ffmpeg.sh");
        tokio::fs::write(&script, format!("#!/bin/sh\n{body}\n"))
            .await
            .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = SupervisorConfig {
            output_root: temp.path().to_path_buf(),
            termination_grace: grace,
            kill_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        config.transcoder.binary_path = script.to_string_lossy().to_string();
        config
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_running_worker() {
        let temp = TempDir::new().unwrap();
        let config = scripted_config(&temp, "exec sleep 30", Duration::from_secs(2)).await;

        let sink = LogSink::new("news1", &config.channel_dir("news1"), 8);
        let tasks = TaskTracker::new();
        let mut worker = ProcessWorker::spawn(&channel(), &config, &sink, &tasks)
            .await
            .unwrap();
        assert!(worker.is_alive());

        let outcome = worker.terminate().await.unwrap();
        assert_eq!(outcome, TerminationOutcome::Graceful);
        assert!(!worker.is_alive());
        assert!(!process_utils::pid_is_alive(worker.pid().unwrap()));

        // Second call is a no-op.
        assert_eq!(
            worker.terminate().await.unwrap(),
            TerminationOutcome::AlreadyExited
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_worker_ignoring_sigterm() {
        let temp = TempDir::new().unwrap();
        let grace = Duration::from_millis(300);
        let config = scripted_config(
            &temp,
            "trap '' TERM\nwhile true; do sleep 1; done",
            grace,
        )
        .await;

        let sink = LogSink::new("news1", &config.channel_dir("news1"), 8);
        let tasks = TaskTracker::new();
        let mut worker = ProcessWorker::spawn(&channel(), &config, &sink, &tasks)
            .await
            .unwrap();
        let pid = worker.pid().unwrap();

        // Let the shell install its trap before signalling.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(worker.is_alive());

        let started = std::time::Instant::now();
        let outcome = worker.terminate().await.unwrap();
        assert_eq!(outcome, TerminationOutcome::Forced);
        assert!(started.elapsed() >= grace);
        assert!(!worker.is_alive());
        assert!(worker.probe().exit_info().is_some());
        assert!(!process_utils::pid_is_alive(pid));
    }
}
