//! Polling loop that turns raw clipboard reads into [`ClipboardChangeEvent`]s.
//!
//! One task per running monitor. Each wake-up does at most three things, in
//! order: commit a held change whose deadline passed, run the optimize pass,
//! read the clipboard. Reads are spaced by the adaptive interval and never
//! closer than the rate limit.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::classify::{classify, is_significant};
use super::polling::AdaptivePollingState;
use super::source::ClipboardSource;
use super::ClipboardChangeEvent;
use crate::events::{EventBus, MonitorEvent};
use crate::settings::MonitorSettings;

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub paused: bool,
    pub interval_ms: u64,
    pub changes_last_minute: usize,
    pub read_failures: u32,
    pub has_pending_change: bool,
}

pub struct ClipboardMonitor {
    source: Arc<dyn ClipboardSource>,
    events: EventBus<MonitorEvent>,
    inner: Arc<Mutex<MonitorState>>,
    wake: Arc<Notify>,
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A valid change waiting out the debounce window.
struct PendingChange {
    value: String,
    deadline: Instant,
}

struct MonitorState {
    settings: MonitorSettings,
    running: bool,
    task: Option<RunningTask>,
    /// Last value read from the clipboard, valid or not.
    last_raw: String,
    /// Last value carried by an emitted event.
    last_accepted: String,
    last_emit_at: Option<Instant>,
    last_read_at: Option<Instant>,
    pending: Option<PendingChange>,
    polling: AdaptivePollingState,
    read_failures: u32,
    next_poll: Instant,
    next_optimize: Instant,
}

impl ClipboardMonitor {
    pub fn new(source: Arc<dyn ClipboardSource>, settings: MonitorSettings) -> Arc<Self> {
        let now = Instant::now();
        let polling = AdaptivePollingState::new(&settings, settings.initial_interval_ms, now);
        Arc::new(Self {
            source,
            events: EventBus::new(),
            inner: Arc::new(Mutex::new(MonitorState {
                settings,
                running: false,
                task: None,
                last_raw: String::new(),
                last_accepted: String::new(),
                last_emit_at: None,
                last_read_at: None,
                pending: None,
                polling,
                read_failures: 0,
                next_poll: now,
                next_optimize: now,
            })),
            wake: Arc::new(Notify::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> EventBus<MonitorEvent> {
        self.events.clone()
    }

    /// Start polling. Returns false, changing nothing, when already running.
    ///
    /// Whatever the clipboard holds at start becomes the baseline and is not
    /// reported as a change.
    pub async fn start(&self, interval_ms: u64) -> bool {
        if self.inner.lock().await.running {
            return false;
        }
        let baseline = match self.source.read_text().await {
            Ok(text) => text.unwrap_or_default(),
            Err(err) => {
                log::warn!("clipboard baseline read failed: {err:#}");
                String::new()
            }
        };

        let mut state = self.inner.lock().await;
        // A concurrent start may have won while the baseline was read.
        if state.running {
            return false;
        }
        let now = Instant::now();
        state.reset(now, interval_ms, baseline);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.inner),
            Arc::clone(&self.source),
            self.events.clone(),
            Arc::clone(&self.wake),
            cancel.clone(),
        ));
        state.task = Some(RunningTask { cancel, handle });
        state.running = true;

        let interval_ms = state.polling.active_interval_ms;
        log::info!("clipboard monitor started ({interval_ms}ms)");
        self.events.emit(MonitorEvent::MonitoringStarted { interval_ms });
        true
    }

    /// Stop polling and drop any held change. Returns false when not running.
    pub async fn stop(&self) -> bool {
        let task = {
            let mut state = self.inner.lock().await;
            if !state.running {
                return false;
            }
            state.running = false;
            state.pending = None;
            state.task.take()
        };
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
        log::info!("clipboard monitor stopped");
        self.events.emit(MonitorEvent::MonitoringStopped);
        true
    }

    /// Override the poll interval (clamped to the configured bounds).
    pub async fn update_interval(&self, interval_ms: u64) {
        let mut state = self.inner.lock().await;
        if state.polling.set_interval(interval_ms) && state.running {
            let now = Instant::now();
            state.next_poll = now + state.polling.interval();
            self.wake.notify_one();
        }
    }

    /// Current clipboard text, or an empty string when unreadable.
    pub async fn get_current_content(&self) -> String {
        match self.source.read_text().await {
            Ok(text) => text.unwrap_or_default(),
            Err(err) => {
                log::warn!("clipboard read failed: {err:#}");
                String::new()
            }
        }
    }

    pub async fn clear(&self) -> bool {
        match self.source.clear().await {
            Ok(()) => {
                let mut state = self.inner.lock().await;
                state.last_raw.clear();
                state.pending = None;
                true
            }
            Err(err) => {
                log::warn!("clipboard clear failed: {err:#}");
                false
            }
        }
    }

    pub async fn status(&self) -> MonitorStatus {
        let mut state = self.inner.lock().await;
        let now = Instant::now();
        MonitorStatus {
            running: state.running,
            paused: state.polling.is_paused,
            interval_ms: state.polling.active_interval_ms,
            changes_last_minute: state.polling.changes_in_window(now),
            read_failures: state.read_failures,
            has_pending_change: state.pending.is_some(),
        }
    }
}

async fn run_loop(
    inner: Arc<Mutex<MonitorState>>,
    source: Arc<dyn ClipboardSource>,
    events: EventBus<MonitorEvent>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let wake_at = inner.lock().await.next_wake();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => continue,
            _ = tokio::time::sleep_until(wake_at) => {}
        }

        {
            let mut state = inner.lock().await;
            if !state.running || cancel.is_cancelled() {
                break;
            }
            if !state.prepare_read(&events) {
                continue;
            }
        }

        // The state lock is free while the platform clipboard answers.
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = source.read_text() => result,
        };

        let mut state = inner.lock().await;
        if !state.running || cancel.is_cancelled() {
            break;
        }
        if !state.finish_read(result, &events) {
            break;
        }
    }
}

impl MonitorState {
    fn reset(&mut self, now: Instant, interval_ms: u64, baseline: String) {
        self.polling = AdaptivePollingState::new(&self.settings, interval_ms, now);
        self.last_raw = baseline.clone();
        self.last_accepted = baseline;
        self.last_emit_at = None;
        self.last_read_at = Some(now);
        self.pending = None;
        self.read_failures = 0;
        self.next_poll = now + self.polling.interval();
        self.next_optimize = now + Duration::from_millis(self.settings.optimize_every_ms);
    }

    fn next_wake(&self) -> Instant {
        let mut at = self.next_poll.min(self.next_optimize);
        if let Some(pending) = &self.pending {
            at = at.min(pending.deadline);
        }
        at
    }

    /// Housekeeping for one wake-up. Returns true when a read is due now.
    fn prepare_read(&mut self, events: &EventBus<MonitorEvent>) -> bool {
        let now = Instant::now();

        if self.pending.as_ref().is_some_and(|p| now >= p.deadline) {
            self.commit(now, events);
        }
        if now >= self.next_optimize {
            self.optimize(now, events);
        }
        if now < self.next_poll {
            return false;
        }

        let rate_limit = Duration::from_millis(self.settings.rate_limit_ms);
        if let Some(last) = self.last_read_at {
            if now.saturating_duration_since(last) < rate_limit {
                self.next_poll = last + rate_limit;
                return false;
            }
        }
        self.last_read_at = Some(now);
        true
    }

    /// Apply a read result. Returns false when the loop must end.
    fn finish_read(
        &mut self,
        result: anyhow::Result<Option<String>>,
        events: &EventBus<MonitorEvent>,
    ) -> bool {
        match result {
            Ok(text) => {
                self.read_failures = 0;
                let read_at = Instant::now();
                self.next_poll = read_at + self.polling.interval();
                if let Some(text) = text {
                    self.observe(text, read_at, events);
                }
                true
            }
            Err(err) => self.read_failed(err, events),
        }
    }

    fn read_failed(&mut self, err: anyhow::Error, events: &EventBus<MonitorEvent>) -> bool {
        self.read_failures += 1;
        let attempt = self.read_failures;
        let message = format!("{err:#}");

        if attempt > self.settings.max_read_retries {
            log::error!("clipboard read failed {attempt} times, stopping monitor: {message}");
            self.running = false;
            self.pending = None;
            // Dropping our own handle detaches; the loop exits right after.
            self.task = None;
            events.emit(MonitorEvent::Error {
                message,
                attempt,
                fatal: true,
            });
            events.emit(MonitorEvent::MonitoringStopped);
            return false;
        }

        let backoff = self.settings.read_retry_base_ms.saturating_mul(1u64 << (attempt - 1).min(16));
        log::warn!("clipboard read failed (attempt {attempt}), retrying in {backoff}ms: {message}");
        self.next_poll = Instant::now() + Duration::from_millis(backoff);
        events.emit(MonitorEvent::Error {
            message,
            attempt,
            fatal: false,
        });
        true
    }

    fn observe(&mut self, text: String, now: Instant, events: &EventBus<MonitorEvent>) {
        // Paused ticks stop here unless the clipboard actually moved.
        if text == self.last_raw {
            return;
        }
        self.last_raw = text.clone();
        self.polling.record_activity(now);
        if self.polling.wake(now) {
            log::debug!("clipboard monitor resumed on activity");
            events.emit(MonitorEvent::MonitoringResumed);
        }

        if !self.passes_validity(&text) {
            // The held value is no longer what the clipboard holds.
            self.pending = None;
            return;
        }

        let debounce_end = now + Duration::from_millis(self.settings.debounce_ms);
        let deadline = match self.last_emit_at {
            Some(last) => debounce_end.max(last + Duration::from_millis(self.settings.min_change_interval_ms)),
            None => debounce_end,
        };
        self.pending = Some(PendingChange {
            value: text,
            deadline,
        });
    }

    fn passes_validity(&self, text: &str) -> bool {
        if text.is_empty() && self.last_accepted.is_empty() {
            return false;
        }
        let len = text.chars().count();
        if len < self.settings.min_length || len > self.settings.max_length {
            return false;
        }
        text != self.last_accepted
    }

    fn commit(&mut self, now: Instant, events: &EventBus<MonitorEvent>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let previous = std::mem::replace(&mut self.last_accepted, pending.value.clone());
        let content_type = classify(&pending.value);
        let event = ClipboardChangeEvent {
            is_significant: is_significant(&previous, &pending.value, self.settings.significance),
            length: pending.value.chars().count(),
            is_empty: pending.value.is_empty(),
            previous_value: previous,
            new_value: pending.value,
            content_type,
            timestamp: unix_millis(),
        };
        self.last_emit_at = Some(now);
        self.polling.record_change(now);
        log::debug!(
            "clipboard changed: {} ({} chars)",
            content_type.as_str(),
            event.length
        );
        events.emit(MonitorEvent::ClipboardChanged(event));
    }

    fn optimize(&mut self, now: Instant, events: &EventBus<MonitorEvent>) {
        let outcome = self.polling.optimize(now);
        if let Some(ms) = outcome.restart_with_ms {
            log::debug!("poll interval now {ms}ms");
            self.next_poll = now + Duration::from_millis(ms);
        }
        if outcome.paused {
            log::info!("clipboard monitor paused after inactivity");
            events.emit(MonitorEvent::MonitoringPaused);
        }
        if outcome.resumed {
            events.emit(MonitorEvent::MonitoringResumed);
        }
        self.next_optimize = now + Duration::from_millis(self.settings.optimize_every_ms);
    }
}

fn unix_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::{ContentType, MemoryClipboard};

    fn monitor(clipboard: &MemoryClipboard) -> Arc<ClipboardMonitor> {
        ClipboardMonitor::new(Arc::new(clipboard.clone()), MonitorSettings::default())
    }

    async fn next_change(rx: &mut broadcast::Receiver<MonitorEvent>) -> ClipboardChangeEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(120), rx.recv())
                .await
                .expect("event before timeout")
                .expect("bus open");
            if let MonitorEvent::ClipboardChanged(change) = event {
                return change;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let clipboard = MemoryClipboard::new();
        let monitor = monitor(&clipboard);
        assert!(monitor.start(500).await);
        assert!(!monitor.start(500).await);
        assert!(monitor.status().await.running);
        assert!(monitor.stop().await);
        assert!(!monitor.stop().await);
        assert!(!monitor.status().await.running);
    }

    #[tokio::test(start_paused = true)]
    async fn url_copied_onto_empty_clipboard_is_reported() {
        let clipboard = MemoryClipboard::new();
        let monitor = monitor(&clipboard);
        let mut rx = monitor.subscribe();
        monitor.start(500).await;

        clipboard.set_text("https://example.com").await;
        let change = next_change(&mut rx).await;
        assert_eq!(change.previous_value, "");
        assert_eq!(change.new_value, "https://example.com");
        assert_eq!(change.content_type, ContentType::Url);
        assert!(change.is_significant);
        assert_eq!(change.length, 19);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn baseline_content_is_not_reported() {
        let clipboard = MemoryClipboard::new();
        clipboard.set_text("already here").await;
        let monitor = monitor(&clipboard);
        let mut rx = monitor.subscribe();
        monitor.start(100).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        clipboard.set_text("something new").await;
        let change = next_change(&mut rx).await;
        assert_eq!(change.previous_value, "already here");
        assert_eq!(change.new_value, "something new");
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn too_short_values_are_ignored() {
        let clipboard = MemoryClipboard::new();
        let monitor = monitor(&clipboard);
        let mut rx = monitor.subscribe();
        monitor.start(100).await;

        clipboard.set_text("ab").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        clipboard.set_text("abc").await;
        let change = next_change(&mut rx).await;
        assert_eq!(change.previous_value, "");
        assert_eq!(change.new_value, "abc");
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn changes_inside_min_interval_collapse_to_the_latest() {
        let clipboard = MemoryClipboard::new();
        let monitor = monitor(&clipboard);
        let mut rx = monitor.subscribe();
        monitor.start(100).await;

        clipboard.set_text("alpha value").await;
        let first = next_change(&mut rx).await;
        let first_at = Instant::now();
        assert_eq!(first.new_value, "alpha value");

        clipboard.set_text("beta value").await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        clipboard.set_text("gamma value").await;

        let second = next_change(&mut rx).await;
        assert_eq!(second.previous_value, "alpha value");
        assert_eq!(second.new_value, "gamma value");
        assert!(Instant::now().duration_since(first_at) >= Duration::from_millis(500));
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reverting_to_the_accepted_value_drops_the_held_change() {
        let clipboard = MemoryClipboard::new();
        let monitor = monitor(&clipboard);
        let mut rx = monitor.subscribe();
        monitor.start(100).await;

        clipboard.set_text("first copy").await;
        next_change(&mut rx).await;

        clipboard.set_text("accidental").await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        clipboard.set_text("first copy").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!monitor.status().await.has_pending_change);

        clipboard.set_text("second copy").await;
        let change = next_change(&mut rx).await;
        assert_eq!(change.previous_value, "first copy");
        assert_eq!(change.new_value, "second copy");
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_read_failures_stop_the_monitor() {
        let clipboard = MemoryClipboard::new();
        let monitor = monitor(&clipboard);
        let mut rx = monitor.subscribe();
        monitor.start(100).await;
        clipboard.fail_next_reads(10).await;

        let mut errors = Vec::new();
        loop {
            match rx.recv().await.expect("bus open") {
                MonitorEvent::Error { attempt, fatal, .. } => errors.push((attempt, fatal)),
                MonitorEvent::MonitoringStopped => break,
                _ => {}
            }
        }
        assert_eq!(errors, vec![(1, false), (2, false), (3, false), (4, true)]);
        assert!(!monitor.status().await.running);
        assert!(!monitor.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn a_successful_read_resets_the_failure_count() {
        let clipboard = MemoryClipboard::new();
        let monitor = monitor(&clipboard);
        let mut rx = monitor.subscribe();
        monitor.start(100).await;
        clipboard.fail_next_reads(2).await;
        clipboard.set_text("recovered text").await;

        let change = next_change(&mut rx).await;
        assert_eq!(change.new_value, "recovered text");
        let status = monitor.status().await;
        assert!(status.running);
        assert_eq!(status.read_failures, 0);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_when_idle_and_resumes_on_new_content() {
        let clipboard = MemoryClipboard::new();
        let monitor = monitor(&clipboard);
        let mut rx = monitor.subscribe();
        monitor.start(500).await;

        loop {
            let event = rx.recv().await.expect("bus open");
            if matches!(event, MonitorEvent::MonitoringPaused) {
                break;
            }
        }
        assert!(monitor.status().await.paused);

        clipboard.set_text("wake up call").await;
        let mut resumed = false;
        loop {
            match rx.recv().await.expect("bus open") {
                MonitorEvent::MonitoringResumed => resumed = true,
                MonitorEvent::ClipboardChanged(change) => {
                    assert_eq!(change.new_value, "wake up call");
                    break;
                }
                _ => {}
            }
        }
        assert!(resumed);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn update_interval_is_clamped() {
        let clipboard = MemoryClipboard::new();
        let monitor = monitor(&clipboard);
        monitor.start(500).await;
        monitor.update_interval(5).await;
        assert_eq!(monitor.status().await.interval_ms, 100);
        monitor.update_interval(1_000).await;
        assert_eq!(monitor.status().await.interval_ms, 1_000);
        monitor.stop().await;
    }

    /// Answers the baseline read, then never answers again.
    struct HangingClipboard {
        reads: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl ClipboardSource for HangingClipboard {
        async fn read_text(&self) -> anyhow::Result<Option<String>> {
            use std::sync::atomic::Ordering;
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(None);
            }
            std::future::pending().await
        }

        async fn clear(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_hung_read_does_not_block_status_or_stop() {
        let source = Arc::new(HangingClipboard {
            reads: std::sync::atomic::AtomicU32::new(0),
        });
        let monitor = ClipboardMonitor::new(source.clone(), MonitorSettings::default());
        monitor.start(100).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.reads.load(std::sync::atomic::Ordering::SeqCst), 2);

        let status = tokio::time::timeout(Duration::from_secs(1), monitor.status())
            .await
            .expect("status while a read is pending");
        assert!(status.running);
        monitor.update_interval(1_000).await;
        let stopped = tokio::time::timeout(Duration::from_secs(1), monitor.stop())
            .await
            .expect("stop while a read is pending");
        assert!(stopped);
        assert!(!monitor.status().await.running);
    }

    #[tokio::test]
    async fn clear_empties_the_clipboard() {
        let clipboard = MemoryClipboard::new();
        clipboard.set_text("secret-ish").await;
        let monitor = monitor(&clipboard);
        assert_eq!(monitor.get_current_content().await, "secret-ish");
        assert!(monitor.clear().await);
        assert_eq!(monitor.get_current_content().await, "");
    }
}
