//! The single capability both generation backends implement.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::GenerationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ollama,
    Gemini,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Ollama, BackendKind::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Gemini => "gemini",
        }
    }

    /// Runs on this machine and needs no credential.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Ollama)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "gemini" => Ok(Self::Gemini),
            other => Err(anyhow!("unknown backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 2048,
        }
    }
}

/// Read-only once dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub backend: BackendKind,
    pub model: String,
    #[serde(flatten)]
    pub options: GenerationOptions,
    pub stream: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

/// Accumulates streamed text; frozen once [`GenerationResult::finish`] ran.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationResult {
    pub full_text: String,
    pub model: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub done: bool,
}

impl GenerationResult {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn push_token(&mut self, token: &str) {
        if !self.done {
            self.full_text.push_str(token);
        }
    }

    pub fn finish(&mut self, finish_reason: Option<String>, usage: Option<Usage>) {
        if self.done {
            return;
        }
        self.finish_reason = finish_reason;
        self.usage = usage;
        self.done = true;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub modified_at: Option<String>,
    pub description: Option<String>,
}

/// Where backends push incremental text.
///
/// Cheap to clone; every clone feeds the same receiver. The sink remembers
/// whether anything was delivered so retry logic can tell a clean failure
/// from one that already produced output.
#[derive(Debug, Clone)]
pub struct TokenSink {
    tx: Option<mpsc::UnboundedSender<String>>,
    delivered: Arc<AtomicBool>,
}

impl TokenSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                delivered: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// A sink that drops every token.
    pub fn discard() -> Self {
        Self {
            tx: None,
            delivered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn send(&self, token: &str) {
        if token.is_empty() {
            return;
        }
        self.delivered.store(true, Ordering::SeqCst);
        if let Some(tx) = &self.tx {
            let _ = tx.send(token.to_string());
        }
    }

    pub fn delivered(&self) -> bool {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Probe the service once and remember the outcome.
    async fn initialize(&self) -> bool;

    fn is_initialized(&self) -> bool;

    async fn check_connection(&self) -> bool;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, GenerationError>;

    async fn set_model(&self, name: &str);

    async fn model(&self) -> String;

    /// Run one attempt. Tokens go to `sink` as they arrive; the returned
    /// result carries the full text and backend metadata.
    async fn generate(
        &self,
        request: &GenerationRequest,
        sink: &TokenSink,
    ) -> Result<GenerationResult, GenerationError>;

    async fn validate_model(&self, name: &str) -> bool;

    async fn health_check(&self) -> bool;

    async fn has_credentials(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!("Gemini".parse::<BackendKind>().expect("parse"), BackendKind::Gemini);
        assert_eq!(" ollama ".parse::<BackendKind>().expect("parse"), BackendKind::Ollama);
        assert!("openai".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Gemini.to_string(), "gemini");
    }

    #[test]
    fn result_is_frozen_after_finish() {
        let mut result = GenerationResult::new("llama3.2");
        result.push_token("Hel");
        result.push_token("lo");
        result.finish(Some("stop".into()), None);
        result.push_token(" ignored");
        result.finish(Some("length".into()), None);
        assert_eq!(result.full_text, "Hello");
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
        assert!(result.done);
    }

    #[tokio::test]
    async fn sink_tracks_delivery() {
        let (sink, mut rx) = TokenSink::channel();
        assert!(!sink.delivered());
        sink.send("");
        assert!(!sink.delivered());
        sink.clone().send("hi");
        assert!(sink.delivered());
        assert_eq!(rx.recv().await.as_deref(), Some("hi"));
    }
}
