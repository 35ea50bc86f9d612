//! Stream supervisor: the registry of channel sessions.
//!
//! The `StreamSupervisor` is responsible for:
//! - Starting, stopping and restarting a channel's transcoder
//! - Owning each session's health monitor and segment janitor tasks
//! - Answering status queries from a lock-free snapshot
//! - Terminating every worker and joining every task on shutdown
//!
//! Every mutation of a channel goes through that channel's async mutex, so
//! concurrent starts collapse into one launch while other channels proceed
//! in parallel.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::config::SupervisorConfig;
use super::janitor::{SegmentJanitor, count_segments};
use super::log_sink::{LOG_FILE_NAME, LogSink};
use super::monitor::HealthMonitor;
use super::restart_tracker::RestartTracker;
use super::state::{
    ChannelShutdown, MonitorState, RestartReason, RestartRecord, ShutdownReport, StreamInfo,
    StreamSnapshot, StreamStatus,
};
use super::worker::{PLAYLIST_FILE_NAME, ProcessWorker, TerminationOutcome, WorkerProbe};
use crate::catalog::{ChannelCatalog, ChannelDescriptor};
use crate::utils::fs::{age_of, modified_at};
use crate::{Error, Result};

/// Poll period of `await_ready`.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A started channel: its worker (if one is running) and the token that
/// cancels the session's background tasks.
struct ActiveSession {
    id: u64,
    worker: Option<ProcessWorker>,
    token: CancellationToken,
}

struct ChannelSlot {
    channel: ChannelDescriptor,
    /// Per-channel critical section for start/stop/restart/respawn.
    session: tokio::sync::Mutex<Option<ActiveSession>>,
    /// Read by status queries without touching `session`.
    snapshot: RwLock<StreamSnapshot>,
    sink: LogSink,
}

impl ChannelSlot {
    fn snapshot(&self) -> StreamSnapshot {
        self.snapshot.read().clone()
    }
}

struct Inner {
    catalog: Arc<dyn ChannelCatalog>,
    config: SupervisorConfig,
    slots: DashMap<String, Arc<ChannelSlot>>,
    restarts: Mutex<RestartTracker>,
    root_token: CancellationToken,
    tasks: TaskTracker,
    shutting_down: AtomicBool,
    next_session: AtomicU64,
}

/// Supervises one transcoder per channel. Cheap to clone.
#[derive(Clone)]
pub struct StreamSupervisor {
    inner: Arc<Inner>,
}

impl StreamSupervisor {
    pub fn new(catalog: Arc<dyn ChannelCatalog>, config: SupervisorConfig) -> Result<Self> {
        config.validate()?;
        let restarts = RestartTracker::with_config(config.restart.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                catalog,
                config,
                slots: DashMap::new(),
                restarts: Mutex::new(restarts),
                root_token: CancellationToken::new(),
                tasks: TaskTracker::new(),
                shutting_down: AtomicBool::new(false),
                next_session: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &Arc<dyn ChannelCatalog> {
        &self.inner.catalog
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Start a channel. Returns immediately if it is already running.
    ///
    /// A failed launch is returned to the caller, but the channel stays
    /// expected-running and the health monitor keeps retrying with backoff
    /// until it is stopped.
    pub async fn start(&self, channel_id: &str) -> Result<StreamInfo> {
        self.ensure_accepting()?;
        let slot = self.slot(channel_id)?;
        let mut session = slot.session.lock().await;
        self.ensure_accepting()?;

        if let Some(active) = session.as_ref() {
            if let Some(worker) = active.worker.as_ref().filter(|w| w.is_alive()) {
                debug!(channel_id, pid = ?worker.pid(), "Channel already running");
                return Ok(self.stream_info(&slot.channel, Some(worker), false));
            }
        }

        if let Some(old) = session.take() {
            let _ = self.teardown(&slot, old).await;
        }

        let (active, launched) = self.launch(&slot).await;
        let info = self.stream_info(&slot.channel, active.worker.as_ref(), true);
        *session = Some(active);

        launched.map(|()| info)
    }

    /// Stop a channel. A no-op if it is not running.
    ///
    /// The worker is always forgotten; a worker that could not be confirmed
    /// dead is logged, not returned as an error.
    pub async fn stop(&self, channel_id: &str) -> Result<()> {
        self.lookup(channel_id)?;
        let Some(slot) = self.existing_slot(channel_id) else {
            return Ok(());
        };

        let mut session = slot.session.lock().await;
        if let Some(active) = session.take() {
            info!(channel_id, "Stopping channel");
            let _ = self.teardown(&slot, active).await;
        }
        self.inner.restarts.lock().remove(channel_id);
        Ok(())
    }

    /// Stop and start a channel inside one critical section.
    pub async fn restart(&self, channel_id: &str) -> Result<StreamInfo> {
        self.ensure_accepting()?;
        let slot = self.slot(channel_id)?;
        let mut session = slot.session.lock().await;
        self.ensure_accepting()?;

        info!(channel_id, "Restarting channel");
        if let Some(old) = session.take() {
            let _ = self.teardown(&slot, old).await;
        }

        {
            let mut snapshot = slot.snapshot.write();
            snapshot.last_restart = Some(RestartRecord {
                reason: RestartReason::Manual,
                at: Utc::now(),
            });
            snapshot.restart_count += 1;
        }

        let (active, launched) = self.launch(&slot).await;
        let info = self.stream_info(&slot.channel, active.worker.as_ref(), true);
        *session = Some(active);

        launched.map(|()| info)
    }

    /// Status of one channel.
    pub async fn status(&self, channel_id: &str) -> Result<StreamStatus> {
        let channel = self.lookup(channel_id)?;
        Ok(self.build_status(&channel).await)
    }

    /// Status of every catalog channel, in catalog order.
    pub async fn status_all(&self) -> Vec<StreamStatus> {
        let channels = self.inner.catalog.list_all();
        join_all(channels.iter().map(|c| self.build_status(c))).await
    }

    /// Wait up to `timeout` for the running worker's first playlist.
    pub async fn await_ready(&self, channel_id: &str, timeout: Duration) -> Result<PathBuf> {
        self.lookup(channel_id)?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(path) = self.ready_playlist(channel_id).await {
                return Ok(path);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::not_ready(channel_id));
            }

            tokio::select! {
                _ = self.inner.root_token.cancelled() => return Err(Error::ShuttingDown),
                _ = tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + READY_POLL_INTERVAL)) => {}
            }
        }
    }

    /// Playlist to serve for a channel. Never starts the channel.
    ///
    /// A stopped channel keeps serving its last playlist.
    pub async fn resolve_playlist(&self, channel_id: &str) -> Result<PathBuf> {
        self.lookup(channel_id)?;
        let path = self.inner.config.channel_dir(channel_id).join(PLAYLIST_FILE_NAME);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(Error::not_ready(channel_id)),
        }
    }

    /// Output directory of a catalog channel.
    pub fn output_dir(&self, channel_id: &str) -> Result<PathBuf> {
        self.lookup(channel_id)?;
        Ok(self.inner.config.channel_dir(channel_id))
    }

    /// Last `lines` lines of a channel's transcoder log.
    pub async fn tail_log(&self, channel_id: &str, lines: usize) -> Result<Vec<String>> {
        self.lookup(channel_id)?;
        if let Some(slot) = self.existing_slot(channel_id) {
            return Ok(slot.sink.tail(lines));
        }

        // Never started in this process: fall back to the file on disk.
        let path = self.inner.config.channel_dir(channel_id).join(LOG_FILE_NAME);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let all: Vec<&str> = contents.lines().collect();
                let skip = all.len().saturating_sub(lines);
                Ok(all[skip..].iter().map(|l| l.to_string()).collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::io_path("reading transcoder log", &path, e)),
        }
    }

    /// Stop every channel and join every background task.
    ///
    /// Later starts fail with `ShuttingDown`.
    pub async fn shutdown(&self) -> ShutdownReport {
        let began = std::time::Instant::now();
        let first = !self.inner.shutting_down.swap(true, Ordering::SeqCst);
        if first {
            info!(channels = self.inner.slots.len(), "Shutting down stream supervisor");
        }

        self.inner.root_token.cancel();

        let slots: Vec<Arc<ChannelSlot>> = self
            .inner
            .slots
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let stopped = join_all(slots.iter().map(|slot| async move {
            let mut session = slot.session.lock().await;
            let active = session.take()?;
            let result = self.teardown(slot, active).await;
            Some(ChannelShutdown {
                channel_id: slot.channel.id.clone(),
                outcome: result.as_ref().ok().copied().flatten(),
                error: result.err().map(|e| e.to_string()),
            })
        }))
        .await
        .into_iter()
        .flatten()
        .collect();

        self.inner.tasks.close();
        let tasks_joined =
            tokio::time::timeout(self.inner.config.shutdown_timeout, self.inner.tasks.wait())
                .await
                .is_ok();
        if !tasks_joined {
            warn!(
                remaining = self.inner.tasks.len(),
                "Background tasks did not finish within the shutdown timeout"
            );
        }

        let report = ShutdownReport {
            stopped,
            tasks_joined,
            elapsed: began.elapsed(),
        };
        info!(
            channels = report.stopped.len(),
            clean = report.is_clean(),
            elapsed = ?report.elapsed,
            "Stream supervisor stopped"
        );
        report
    }

    /// Replace the worker of a live session. Used by the health monitor.
    ///
    /// Returns `Ok(None)` when the session has been stopped or replaced,
    /// which tells the monitor to exit.
    pub(crate) async fn respawn_worker(
        &self,
        channel_id: &str,
        session_id: u64,
        reason: RestartReason,
    ) -> Result<Option<WorkerProbe>> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let Some(slot) = self.existing_slot(channel_id) else {
            return Ok(None);
        };

        let mut session = slot.session.lock().await;
        let Some(active) = session.as_mut() else {
            return Ok(None);
        };
        if active.id != session_id || active.token.is_cancelled() {
            return Ok(None);
        }

        if let Some(mut old) = active.worker.take() {
            if let Err(e) = old.terminate().await {
                error!(channel_id, error = %e, "Previous transcoder did not exit cleanly");
            }
        }

        slot.sink
            .note(&format!("restarting transcoder: {}", reason))
            .await;
        slot.snapshot.write().restart_count += 1;

        match ProcessWorker::spawn(&slot.channel, &self.inner.config, &slot.sink, &self.inner.tasks)
            .await
        {
            Ok(worker) => {
                let probe = worker.probe();
                self.record_worker(&slot, session_id, &worker, MonitorState::Watching);
                active.worker = Some(worker);
                Ok(Some(probe))
            }
            Err(e) => {
                self.record_launch_failure(&slot, &e);
                Err(e)
            }
        }
    }

    /// Backoff before the next monitor-driven restart of a channel.
    pub(crate) fn restart_backoff(&self, channel_id: &str) -> Duration {
        self.inner.restarts.lock().record_failure(channel_id)
    }

    /// Record a pending restart. Returns false if the session is no longer current.
    pub(crate) fn enter_restart_pending(
        &self,
        channel_id: &str,
        session_id: u64,
        reason: RestartReason,
    ) -> bool {
        self.update_snapshot(channel_id, session_id, |snapshot| {
            snapshot.monitor_state = MonitorState::RestartPending;
            snapshot.last_restart = Some(RestartRecord {
                reason,
                at: Utc::now(),
            });
        })
    }

    pub(crate) fn mark_healthy(&self, channel_id: &str, session_id: u64, last_progress: SystemTime) {
        self.update_snapshot(channel_id, session_id, |snapshot| {
            snapshot.monitor_state = MonitorState::Watching;
            snapshot.last_healthy_at = Some(DateTime::<Utc>::from(last_progress));
        });
    }

    pub(crate) fn set_monitor_state(&self, channel_id: &str, session_id: u64, state: MonitorState) {
        self.update_snapshot(channel_id, session_id, |snapshot| {
            snapshot.monitor_state = state;
        });
    }

    fn update_snapshot(
        &self,
        channel_id: &str,
        session_id: u64,
        f: impl FnOnce(&mut StreamSnapshot),
    ) -> bool {
        let Some(slot) = self.existing_slot(channel_id) else {
            return false;
        };
        let mut snapshot = slot.snapshot.write();
        if snapshot.session_id != Some(session_id) {
            return false;
        }
        f(&mut snapshot);
        true
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.is_shutting_down() {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn lookup(&self, channel_id: &str) -> Result<ChannelDescriptor> {
        self.inner
            .catalog
            .lookup(channel_id)
            .ok_or_else(|| Error::channel_not_found(channel_id))
    }

    fn existing_slot(&self, channel_id: &str) -> Option<Arc<ChannelSlot>> {
        self.inner.slots.get(channel_id).map(|entry| entry.value().clone())
    }

    /// Slot of a catalog channel, created on first use.
    fn slot(&self, channel_id: &str) -> Result<Arc<ChannelSlot>> {
        if let Some(slot) = self.existing_slot(channel_id) {
            return Ok(slot);
        }

        let channel = self.lookup(channel_id)?;
        let slot = self
            .inner
            .slots
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                let sink = LogSink::new(
                    &channel.id,
                    &self.inner.config.channel_dir(&channel.id),
                    self.inner.config.log_tail_lines,
                );
                Arc::new(ChannelSlot {
                    channel,
                    session: tokio::sync::Mutex::new(None),
                    snapshot: RwLock::new(StreamSnapshot::default()),
                    sink,
                })
            })
            .value()
            .clone();
        Ok(slot)
    }

    /// Start a new session: worker plus monitor and janitor.
    ///
    /// The session is returned even if the worker failed to launch, so the
    /// monitor can retry.
    async fn launch(&self, slot: &Arc<ChannelSlot>) -> (ActiveSession, Result<()>) {
        let channel = &slot.channel;
        let config = &self.inner.config;
        let session_id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        let token = self.inner.root_token.child_token();

        {
            let mut snapshot = slot.snapshot.write();
            snapshot.session_id = Some(session_id);
            snapshot.last_healthy_at = None;
        }

        let spawned =
            ProcessWorker::spawn(channel, config, &slot.sink, &self.inner.tasks).await;

        let (worker, result) = match spawned {
            Ok(worker) => {
                slot.sink
                    .note(&format!("transcoder started (pid {:?})", worker.pid()))
                    .await;
                self.record_worker(slot, session_id, &worker, MonitorState::Watching);
                (Some(worker), Ok(()))
            }
            Err(e) => {
                error!(channel_id = %channel.id, error = %e, "Failed to start channel");
                slot.sink.note(&format!("launch failed: {}", e)).await;
                self.record_launch_failure(slot, &e);
                (None, Err(e))
            }
        };

        let probe = worker.as_ref().map(|w| w.probe());
        self.inner.tasks.spawn(
            HealthMonitor::new(&channel.id, session_id, self.clone(), probe, token.clone()).run(),
        );
        self.inner.tasks.spawn(
            SegmentJanitor::new(
                &channel.id,
                config.channel_dir(&channel.id),
                config.retention.clone(),
                config.janitor_interval,
                token.clone(),
            )
            .run(),
        );

        (
            ActiveSession {
                id: session_id,
                worker,
                token,
            },
            result,
        )
    }

    /// End a session: cancel its tasks and terminate its worker.
    async fn teardown(
        &self,
        slot: &ChannelSlot,
        mut active: ActiveSession,
    ) -> Result<Option<TerminationOutcome>> {
        active.token.cancel();

        let result = match active.worker.as_mut() {
            Some(worker) => worker.terminate().await.map(Some),
            None => Ok(None),
        };

        match &result {
            Ok(Some(outcome)) => {
                debug!(channel_id = %slot.channel.id, outcome = ?outcome, "Transcoder stopped");
                slot.sink
                    .note(&format!("transcoder stopped ({:?})", outcome))
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                error!(channel_id = %slot.channel.id, error = %e, "Transcoder did not stop cleanly");
            }
        }

        let mut snapshot = slot.snapshot.write();
        snapshot.session_id = None;
        snapshot.probe = None;
        snapshot.pid = None;
        snapshot.monitor_state = MonitorState::Stopped;

        result
    }

    fn record_worker(
        &self,
        slot: &ChannelSlot,
        session_id: u64,
        worker: &ProcessWorker,
        state: MonitorState,
    ) {
        let mut snapshot = slot.snapshot.write();
        snapshot.session_id = Some(session_id);
        snapshot.probe = Some(worker.probe());
        snapshot.pid = worker.pid();
        snapshot.started_at = Some(worker.started_at());
        snapshot.monitor_state = state;
        snapshot.last_error = None;
    }

    fn record_launch_failure(&self, slot: &ChannelSlot, error: &Error) {
        let mut snapshot = slot.snapshot.write();
        snapshot.probe = None;
        snapshot.pid = None;
        snapshot.monitor_state = MonitorState::RestartPending;
        snapshot.last_error = Some(error.to_string());
    }

    fn stream_info(
        &self,
        channel: &ChannelDescriptor,
        worker: Option<&ProcessWorker>,
        launched: bool,
    ) -> StreamInfo {
        let config = &self.inner.config;
        let output_dir = config.channel_dir(&channel.id);
        StreamInfo {
            channel_id: channel.id.clone(),
            pid: worker.and_then(|w| w.pid()),
            started_at: worker.map(|w| w.started_at()),
            playlist_path: output_dir.join(PLAYLIST_FILE_NAME),
            output_dir,
            segment_duration_secs: config.retention.segment_duration_secs,
            max_segments: config.retention.max_segments,
            launched,
        }
    }

    /// Playlist path once the current worker has written it.
    async fn ready_playlist(&self, channel_id: &str) -> Option<PathBuf> {
        let probe = self
            .existing_slot(channel_id)
            .and_then(|slot| slot.snapshot().probe)?;
        if !probe.is_alive() {
            return None;
        }

        let path = self.inner.config.channel_dir(channel_id).join(PLAYLIST_FILE_NAME);
        let modified = modified_at(&path).await?;
        // Coarse filesystem timestamps can round below the spawn time.
        let baseline = probe
            .started_at()
            .checked_sub(Duration::from_secs(1))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        (modified >= baseline).then_some(path)
    }

    async fn build_status(&self, channel: &ChannelDescriptor) -> StreamStatus {
        let config = &self.inner.config;
        let output_dir = config.channel_dir(&channel.id);
        let playlist_path = output_dir.join(PLAYLIST_FILE_NAME);

        let snapshot = self
            .existing_slot(&channel.id)
            .map(|slot| slot.snapshot())
            .unwrap_or_default();

        let output_path_exists = tokio::fs::metadata(&output_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let segment_count = if output_path_exists {
            count_segments(&output_dir).await
        } else {
            0
        };

        let (running, process_healthy, last_progress) = match &snapshot.probe {
            Some(probe) if probe.is_alive() => {
                let progress = probe.last_progress_at().await;
                let healthy = age_of(progress, SystemTime::now()) <= config.stale_threshold();
                (true, healthy, healthy.then_some(progress))
            }
            _ => (false, false, None),
        };

        let last_healthy_at = match (last_progress, snapshot.last_healthy_at) {
            (Some(progress), _) => Some(DateTime::<Utc>::from(progress)),
            (None, recorded) => recorded,
        };

        StreamStatus {
            channel_id: channel.id.clone(),
            running,
            process_healthy,
            pid: if running { snapshot.pid } else { None },
            started_at: snapshot.started_at,
            last_healthy_at,
            segment_count,
            output_path_exists,
            buffered_secs: config.retention.buffered_secs(segment_count),
            output_dir,
            playlist_path,
            monitor_state: snapshot.monitor_state,
            last_restart: snapshot.last_restart,
            restart_count: snapshot.restart_count,
            last_error: snapshot.last_error,
        }
    }
}
