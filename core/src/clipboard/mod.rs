//! Adaptive clipboard monitoring.
//!
//! ```text
//! OS clipboard ─► ClipboardSource ─► ClipboardMonitor ─► MonitorEvent bus
//!                                      │  validity gate
//!                                      │  debounce / min change interval
//!                                      │  classify + significance
//!                                      └► AdaptivePollingState (interval, pause)
//! ```

pub mod classify;
pub mod monitor;
pub mod polling;
pub mod source;

use serde::Serialize;

pub use classify::{classify, is_significant, ContentType, SignificancePolicy};
pub use monitor::{ClipboardMonitor, MonitorStatus};
pub use polling::AdaptivePollingState;
pub use source::{ClipboardSource, MemoryClipboard, SystemClipboard};

/// Immutable snapshot of one accepted clipboard transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClipboardChangeEvent {
    pub previous_value: String,
    pub new_value: String,
    pub content_type: ContentType,
    pub length: usize,
    pub is_empty: bool,
    pub is_significant: bool,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}
