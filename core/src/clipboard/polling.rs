//! Self-tuning poll interval and the paused/active state of the monitor.
//!
//! All methods take `now` explicitly so the state machine stays a pure
//! function of time and can be driven from tests without a runtime.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::settings::MonitorSettings;

const RATE_WINDOW: Duration = Duration::from_secs(60);
/// The timer is only rebuilt when the interval moves by more than this.
const RESTART_THRESHOLD_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct AdaptivePollingState {
    /// Interval the optimizer currently wants.
    pub current_interval_ms: u64,
    /// Interval the running timer was built with.
    pub active_interval_ms: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    change_timestamps: VecDeque<Instant>,
    pub last_activity: Instant,
    pub is_paused: bool,
    idle_threshold: Duration,
    active_threshold: Duration,
    high_rate_per_min: usize,
    pause_after: Duration,
    resume_within: Duration,
}

/// What an optimize pass decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptimizeOutcome {
    /// New interval when the timer must be restarted.
    pub restart_with_ms: Option<u64>,
    pub paused: bool,
    pub resumed: bool,
}

impl AdaptivePollingState {
    pub fn new(settings: &MonitorSettings, interval_ms: u64, now: Instant) -> Self {
        let min = settings.min_interval_ms.max(1);
        let max = settings.max_interval_ms.max(min);
        let interval_ms = interval_ms.clamp(min, max);
        Self {
            current_interval_ms: interval_ms,
            active_interval_ms: interval_ms,
            min_interval_ms: min,
            max_interval_ms: max,
            change_timestamps: VecDeque::new(),
            last_activity: now,
            is_paused: false,
            idle_threshold: Duration::from_millis(settings.idle_threshold_ms),
            active_threshold: Duration::from_millis(settings.active_threshold_ms),
            high_rate_per_min: settings.high_change_rate_per_min,
            pause_after: Duration::from_millis(settings.pause_after_ms),
            resume_within: Duration::from_millis(settings.resume_within_ms),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.active_interval_ms)
    }

    /// Record an accepted change.
    pub fn record_change(&mut self, now: Instant) {
        self.change_timestamps.push_back(now);
        self.last_activity = now;
        self.prune(now);
    }

    /// Record raw clipboard activity that has not (yet) been accepted.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn changes_in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.change_timestamps.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.change_timestamps.front() {
            if now.saturating_duration_since(*front) > RATE_WINDOW {
                self.change_timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Recompute interval and pause state.
    pub fn optimize(&mut self, now: Instant) -> OptimizeOutcome {
        let mut outcome = OptimizeOutcome::default();
        let rate = self.changes_in_window(now);
        let idle_for = now.saturating_duration_since(self.last_activity);

        let current = self.current_interval_ms as f64;
        let mut proposed = current;
        if idle_for > self.idle_threshold {
            proposed = (current * 1.5).min(self.max_interval_ms as f64);
        } else if idle_for < self.active_threshold {
            proposed = (current * 0.8).max(self.min_interval_ms as f64);
        }
        if rate > self.high_rate_per_min {
            proposed = (proposed * 0.7).max(self.min_interval_ms as f64);
        }

        self.current_interval_ms = proposed.round() as u64;
        if self.current_interval_ms.abs_diff(self.active_interval_ms) > RESTART_THRESHOLD_MS {
            self.active_interval_ms = self.current_interval_ms;
            outcome.restart_with_ms = Some(self.active_interval_ms);
        }

        if !self.is_paused && idle_for > self.pause_after {
            self.is_paused = true;
            outcome.paused = true;
        } else if self.is_paused && idle_for < self.resume_within {
            self.is_paused = false;
            outcome.resumed = true;
        }
        outcome
    }

    /// Leave the paused state immediately (fresh activity observed).
    pub fn wake(&mut self, now: Instant) -> bool {
        self.last_activity = now;
        if self.is_paused {
            self.is_paused = false;
            true
        } else {
            false
        }
    }

    /// Explicit interval override; returns true if the timer must restart.
    pub fn set_interval(&mut self, interval_ms: u64) -> bool {
        let clamped = interval_ms.clamp(self.min_interval_ms, self.max_interval_ms);
        let changed = clamped != self.active_interval_ms;
        self.current_interval_ms = clamped;
        self.active_interval_ms = clamped;
        changed
    }
}
