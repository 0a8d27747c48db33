//! Pub/sub boundary between the core and whatever front-end sits on top.
//!
//! Each subsystem owns one [`EventBus`] and publishes a closed enum of
//! events. The serialised names match the listener contract front-ends
//! subscribe to (`clipboard-changed`, `token-received`, `backend-fallback`,
//! ...), so a bridge can forward them without re-mapping.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::agents::{BackendKind, Usage};
use crate::clipboard::ClipboardChangeEvent;
use crate::vault::SecurityAssessment;

const DEFAULT_CAPACITY: usize = 256;

/// Clonable broadcast channel. Emitting never fails, even with no listeners.
#[derive(Debug, Clone)]
pub struct EventBus<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: E) {
        // No receivers is a normal state for a headless core.
        let _ = self.tx.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum MonitorEvent {
    MonitoringStarted { interval_ms: u64 },
    MonitoringStopped,
    MonitoringPaused,
    MonitoringResumed,
    ClipboardChanged(ClipboardChangeEvent),
    Error { message: String, attempt: u32, fatal: bool },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum GenerationEvent {
    GenerationStarted {
        request_id: String,
        backend: BackendKind,
        model: String,
    },
    TokenReceived {
        token: String,
        full_response: String,
        done: bool,
    },
    GenerationCompleted {
        full_response: String,
        model: String,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    },
    Error {
        #[serde(rename = "type")]
        kind: String,
        error: String,
        model: Option<String>,
        retry_count: u32,
    },
    BackendFallback {
        from: BackendKind,
        to: BackendKind,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum VaultEvent {
    Initialized { storage_backend: String },
    ApiKeyStored { name: String },
    ApiKeyRetrieved { name: String },
    ApiKeyDeleted { name: String },
    BackendConfigStored,
    BackendConfigRetrieved,
    SecurityAssessment(SecurityAssessment),
    SecurityWarning { message: String },
    ApiKeyMigrated { name: String, env_var: String },
    ApiKeyExported { name: String },
    ApiKeyImported { name: String },
    Error { operation: String, message: String },
}
