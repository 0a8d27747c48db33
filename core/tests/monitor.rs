use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::sync::broadcast;

use clipwise_core::clipboard::{ClipboardMonitor, MemoryClipboard};
use clipwise_core::events::MonitorEvent;
use clipwise_core::settings::MonitorSettings;

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("runtime")
}

fn changes(rx: &mut broadcast::Receiver<MonitorEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, MonitorEvent::ClipboardChanged(_)) {
            count += 1;
        }
    }
    count
}

/// Start a monitor on an empty clipboard, copy `value`, let two seconds pass.
async fn changes_after_copy(value: String) -> usize {
    let clipboard = MemoryClipboard::new();
    let monitor = ClipboardMonitor::new(Arc::new(clipboard.clone()), MonitorSettings::default());
    let mut rx = monitor.subscribe();
    monitor.start(100).await;
    clipboard.set_text(value).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    monitor.stop().await;
    changes(&mut rx)
}

fn out_of_bounds() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z0-9 ]{0,2}",
        (10_001usize..10_200).prop_map(|n| "x".repeat(n)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn values_outside_the_length_bounds_never_emit(value in out_of_bounds()) {
        let rt = paused_runtime();
        prop_assert_eq!(rt.block_on(changes_after_copy(value)), 0);
    }

    #[test]
    fn values_inside_the_length_bounds_emit_once(value in "[a-z]{3}[a-z .]{0,200}") {
        let rt = paused_runtime();
        prop_assert_eq!(rt.block_on(changes_after_copy(value)), 1);
    }
}

#[test]
fn repeated_copies_of_one_value_emit_once() {
    paused_runtime().block_on(async {
        let clipboard = MemoryClipboard::new();
        let monitor = ClipboardMonitor::new(Arc::new(clipboard.clone()), MonitorSettings::default());
        let mut rx = monitor.subscribe();
        monitor.start(100).await;
        for _ in 0..5 {
            clipboard.set_text("same value").await;
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        monitor.stop().await;
        assert_eq!(changes(&mut rx), 1);
    });
}

#[test]
fn persistent_read_failures_stop_the_monitor() {
    paused_runtime().block_on(async {
        let clipboard = MemoryClipboard::new();
        let monitor = ClipboardMonitor::new(Arc::new(clipboard.clone()), MonitorSettings::default());
        let mut rx = monitor.subscribe();
        monitor.start(100).await;
        clipboard.fail_next_reads(10).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let mut attempts = Vec::new();
        let mut stopped = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                MonitorEvent::Error { attempt, fatal, .. } => attempts.push((attempt, fatal)),
                MonitorEvent::MonitoringStopped => stopped = true,
                _ => {}
            }
        }
        assert_eq!(
            attempts,
            vec![(1, false), (2, false), (3, false), (4, true)]
        );
        assert!(stopped);
        assert!(!monitor.status().await.running);
    });
}

#[test]
fn reads_are_spaced_by_the_rate_limit() {
    paused_runtime().block_on(async {
        let clipboard = MemoryClipboard::new();
        let settings = MonitorSettings {
            initial_interval_ms: 10,
            min_interval_ms: 10,
            rate_limit_ms: 50,
            ..MonitorSettings::default()
        };
        let monitor = ClipboardMonitor::new(Arc::new(clipboard.clone()), settings);
        assert!(monitor.start(10).await);
        assert_eq!(monitor.status().await.interval_ms, 10);
        tokio::time::sleep(Duration::from_secs(1)).await;
        monitor.stop().await;

        // One baseline read, then at most one read per 50ms window.
        let reads = clipboard.read_count().await;
        assert!(reads <= 21, "{reads} reads in one second");
        assert!(reads >= 15, "{reads} reads in one second");
    });
}
