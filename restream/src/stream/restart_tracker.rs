//! Backoff for monitor-driven restarts.
//!
//! A channel that keeps dying gets restarted less and less often: the first
//! few restarts inside the failure window wait `min_delay`, later ones double
//! from `base_backoff` up to `max_backoff`. Restarts older than the window
//! are forgotten.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const MAX_EXPONENT: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartTrackerConfig {
    /// Wait applied to every restart.
    pub min_delay: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Restarts older than this no longer count.
    pub failure_window: Duration,
    /// Restarts inside the window before backoff starts growing.
    pub failure_threshold: usize,
}

impl Default for RestartTrackerConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            failure_window: Duration::from_secs(300),
            failure_threshold: 3,
        }
    }
}

/// Per-channel restart history with windowed exponential backoff.
#[derive(Debug)]
pub struct RestartTracker {
    config: RestartTrackerConfig,
    /// Restart instants inside the failure window, oldest first.
    recent: HashMap<String, VecDeque<Instant>>,
}

impl RestartTracker {
    pub fn with_config(config: RestartTrackerConfig) -> Self {
        Self {
            config,
            recent: HashMap::new(),
        }
    }

    /// Note a restart of `channel_id` and return how long to wait before it.
    pub fn record_failure(&mut self, channel_id: &str) -> Duration {
        self.record_failure_at(channel_id, Instant::now())
    }

    fn record_failure_at(&mut self, channel_id: &str, now: Instant) -> Duration {
        let window = self.config.failure_window;
        let recent = self.recent.entry(channel_id.to_string()).or_default();
        while recent
            .front()
            .is_some_and(|&t| now.duration_since(t) >= window)
        {
            recent.pop_front();
        }
        recent.push_back(now);

        let failures = recent.len();
        let delay = self.delay_for(failures);
        if failures >= self.config.failure_threshold {
            info!(channel_id, failures, delay = ?delay, "Channel is restarting repeatedly, backing off");
        } else {
            debug!(channel_id, failures, delay = ?delay, "Scheduling channel restart");
        }
        delay
    }

    /// `min_delay` below the threshold, then `base * 2^(failures - threshold)`
    /// clamped to `[min_delay, max_backoff]`.
    fn delay_for(&self, failures: usize) -> Duration {
        let RestartTrackerConfig {
            min_delay,
            base_backoff,
            max_backoff,
            failure_threshold,
            ..
        } = self.config;

        let Some(over) = failures.checked_sub(failure_threshold) else {
            return min_delay;
        };
        let exponent = u32::try_from(over).unwrap_or(MAX_EXPONENT).min(MAX_EXPONENT);
        base_backoff
            .saturating_mul(1 << exponent)
            .clamp(min_delay, max_backoff.max(min_delay))
    }

    /// Restarts of `channel_id` inside the failure window.
    pub fn recent_failures(&self, channel_id: &str) -> usize {
        let now = Instant::now();
        self.recent.get(channel_id).map_or(0, |recent| {
            recent
                .iter()
                .filter(|&&t| now.duration_since(t) < self.config.failure_window)
                .count()
        })
    }

    /// Forget a channel after an explicit stop.
    pub fn remove(&mut self, channel_id: &str) {
        self.recent.remove(channel_id);
    }
}
