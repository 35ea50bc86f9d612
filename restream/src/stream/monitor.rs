//! Health monitor: detects dead or stalled workers and restarts them.
//!
//! ```text
//! Watching --(exited | stalled | missing)--> RestartPending
//! RestartPending --(backoff, respawn ok)--> Watching
//! RestartPending --(respawn failed)--> RestartPending (next tick, longer backoff)
//! any --(session cancelled)--> Stopped
//! ```
//!
//! The monitor never touches the channel registry; it observes the worker
//! through a `WorkerProbe` and goes through the supervisor to respawn.

use std::time::{Duration, SystemTime};

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{MonitorState, RestartReason};
use super::supervisor::StreamSupervisor;
use super::worker::WorkerProbe;
use crate::Error;
use crate::utils::fs::age_of;

/// Decide whether a worker needs a restart.
///
/// `last_progress` is the later of the playlist mtime and the worker start.
pub fn assess(
    alive: bool,
    exit_code: Option<i32>,
    last_progress: SystemTime,
    now: SystemTime,
    stale_threshold: Duration,
) -> Option<RestartReason> {
    if !alive {
        return Some(RestartReason::ProcessExited { code: exit_code });
    }

    let stale = age_of(last_progress, now);
    if stale > stale_threshold {
        return Some(RestartReason::StalledOutput {
            stale_ms: u64::try_from(stale.as_millis()).unwrap_or(u64::MAX),
        });
    }

    None
}

async fn check(probe: &WorkerProbe, stale_threshold: Duration) -> (Option<RestartReason>, SystemTime) {
    let last_progress = probe.last_progress_at().await;
    let exit_code = probe.exit_info().and_then(|info| info.code);
    let reason = assess(
        probe.is_alive(),
        exit_code,
        last_progress,
        SystemTime::now(),
        stale_threshold,
    );
    (reason, last_progress)
}

/// Per-session watchdog task.
pub struct HealthMonitor {
    channel_id: String,
    session_id: u64,
    supervisor: StreamSupervisor,
    probe: Option<WorkerProbe>,
    interval: Duration,
    stale_threshold: Duration,
    token: CancellationToken,
}

impl HealthMonitor {
    pub(crate) fn new(
        channel_id: impl Into<String>,
        session_id: u64,
        supervisor: StreamSupervisor,
        probe: Option<WorkerProbe>,
        token: CancellationToken,
    ) -> Self {
        let config = supervisor.config();
        let interval = config.monitor_interval;
        let stale_threshold = config.stale_threshold();
        Self {
            channel_id: channel_id.into(),
            session_id,
            supervisor,
            probe,
            interval,
            stale_threshold,
            token,
        }
    }

    pub async fn run(mut self) {
        debug!(
            channel_id = %self.channel_id,
            session_id = self.session_id,
            interval = ?self.interval,
            stale_threshold = ?self.stale_threshold,
            "Health monitor started"
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let reason = match &self.probe {
                None => RestartReason::WorkerMissing,
                Some(probe) => match check(probe, self.stale_threshold).await {
                    (None, last_progress) => {
                        self.supervisor
                            .mark_healthy(&self.channel_id, self.session_id, last_progress);
                        continue;
                    }
                    (Some(reason), _) => reason,
                },
            };

            if let RestartReason::StalledOutput { stale_ms } = reason {
                let err = Error::WorkerUnresponsive {
                    channel_id: self.channel_id.clone(),
                    reason: format!("no playlist update for {}ms", stale_ms),
                };
                warn!("{}", err);
            } else {
                warn!(channel_id = %self.channel_id, reason = %reason, "Transcoder needs restart");
            }

            if !self.supervisor.enter_restart_pending(
                &self.channel_id,
                self.session_id,
                reason.clone(),
            ) {
                break;
            }

            let backoff = self.supervisor.restart_backoff(&self.channel_id);
            debug!(channel_id = %self.channel_id, backoff = ?backoff, "Waiting before restart");

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }

            match self
                .supervisor
                .respawn_worker(&self.channel_id, self.session_id, reason)
                .await
            {
                Ok(Some(probe)) => {
                    info!(channel_id = %self.channel_id, "Transcoder restarted");
                    self.probe = Some(probe);
                    ticker.reset();
                }
                // Session replaced or stopped while we waited.
                Ok(None) => break,
                Err(Error::ShuttingDown) => break,
                Err(e) => {
                    warn!(
                        channel_id = %self.channel_id,
                        error = %e,
                        "Restart failed, will retry"
                    );
                    self.probe = None;
                }
            }
        }

        self.supervisor
            .set_monitor_state(&self.channel_id, self.session_id, MonitorState::Stopped);
        debug!(channel_id = %self.channel_id, session_id = self.session_id, "Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(20);

    #[test]
    fn test_exited_worker_needs_restart() {
        let now = SystemTime::now();
        assert_eq!(
            assess(false, Some(1), now, now, THRESHOLD),
            Some(RestartReason::ProcessExited { code: Some(1) })
        );
        assert_eq!(
            assess(false, None, now, now, THRESHOLD),
            Some(RestartReason::ProcessExited { code: None })
        );
    }

    #[test]
    fn test_stalled_output_needs_restart() {
        let now = SystemTime::now();
        let last = now - Duration::from_secs(25);
        assert_eq!(
            assess(true, None, last, now, THRESHOLD),
            Some(RestartReason::StalledOutput { stale_ms: 25_000 })
        );
    }

    #[test]
    fn test_sub_second_staleness_is_reported() {
        let now = SystemTime::now();
        let threshold = Duration::from_millis(600);
        let reason = assess(true, None, now - Duration::from_millis(900), now, threshold);
        assert_eq!(reason, Some(RestartReason::StalledOutput { stale_ms: 900 }));
        assert_eq!(
            reason.unwrap().to_string(),
            "playlist has not advanced for 0.9s"
        );
    }

    #[test]
    fn test_fresh_output_is_healthy() {
        let now = SystemTime::now();
        assert_eq!(assess(true, None, now - Duration::from_secs(3), now, THRESHOLD), None);
        assert_eq!(assess(true, None, now - THRESHOLD, now, THRESHOLD), None);
        // Clock skew: mtime in the future still counts as fresh.
        assert_eq!(assess(true, None, now + Duration::from_secs(3), now, THRESHOLD), None);
    }
}
