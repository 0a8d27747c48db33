//! Where clipboard text comes from.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

#[async_trait]
pub trait ClipboardSource: Send + Sync {
    /// Current clipboard text; `None` when the clipboard holds no text.
    async fn read_text(&self) -> Result<Option<String>>;

    async fn clear(&self) -> Result<()>;
}

/// OS clipboard through `arboard`, driven on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct SystemClipboard;

impl SystemClipboard {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClipboardSource for SystemClipboard {
    async fn read_text(&self) -> Result<Option<String>> {
        tokio::task::spawn_blocking(|| {
            let mut clipboard = arboard::Clipboard::new()
                .map_err(|err| anyhow!("clipboard unavailable: {err}"))?;
            match clipboard.get_text() {
                Ok(text) => Ok(Some(text)),
                Err(arboard::Error::ContentNotAvailable) => Ok(None),
                Err(err) => Err(anyhow!("clipboard read failed: {err}")),
            }
        })
        .await
        .map_err(|err| anyhow!(err.to_string()))?
    }

    async fn clear(&self) -> Result<()> {
        tokio::task::spawn_blocking(|| {
            let mut clipboard = arboard::Clipboard::new()
                .map_err(|err| anyhow!("clipboard unavailable: {err}"))?;
            clipboard
                .clear()
                .map_err(|err| anyhow!("clipboard clear failed: {err}"))
        })
        .await
        .map_err(|err| anyhow!(err.to_string()))?
    }
}

/// In-process clipboard for headless runs and tests.
///
/// Reads can be made to fail a fixed number of times to exercise the
/// monitor's retry path.
#[derive(Debug, Clone, Default)]
pub struct MemoryClipboard {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    text: Option<String>,
    failures_left: u32,
    reads: u64,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_text(&self, text: impl Into<String>) {
        self.inner.lock().await.text = Some(text.into());
    }

    pub async fn fail_next_reads(&self, count: u32) {
        self.inner.lock().await.failures_left = count;
    }

    pub async fn read_count(&self) -> u64 {
        self.inner.lock().await.reads
    }
}

#[async_trait]
impl ClipboardSource for MemoryClipboard {
    async fn read_text(&self) -> Result<Option<String>> {
        let mut state = self.inner.lock().await;
        state.reads += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(anyhow!("simulated clipboard failure"));
        }
        Ok(state.text.clone())
    }

    async fn clear(&self) -> Result<()> {
        self.inner.lock().await.text = None;
        Ok(())
    }
}
