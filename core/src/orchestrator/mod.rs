//! Generation orchestration: routing, single-flight dispatch, retries and
//! the event stream front-ends listen to.
//!
//! Per-request state (configuration snapshot, chosen backend, model, token
//! accumulator) lives on the stack of [`GenerationOrchestrator::generate`];
//! the orchestrator itself only keeps the persisted configuration, the
//! session slot and the displayed status.

pub mod pipeline;
pub mod route;
pub mod session;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::{
    build_prompt, run_with_retry, sanitize, BackendConfig, BackendKind, GenerationOptions,
    GenerationRequest, GenerationResult, RetryPolicy, TokenSink,
};
use crate::clipboard::ClipboardChangeEvent;
use crate::errors::{ErrorKind, GenerationError};
use crate::events::{EventBus, GenerationEvent};
use crate::logging::spawn_log_event;
use crate::model_manager::{BackendReadiness, ModelManager};
use crate::settings::CoreSettings;

pub use route::{plan_route, RouteDecision};
pub use session::GenerationSession;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum GenerationStatus {
    Ready,
    Generating {
        request_id: String,
        backend: BackendKind,
        model: String,
    },
    Failed {
        #[serde(rename = "type")]
        error_type: String,
        message: String,
    },
}

#[derive(Debug)]
struct StatusCell {
    status: GenerationStatus,
    failed_at: Option<Instant>,
}

pub struct GenerationOrchestrator {
    models: Arc<ModelManager>,
    config: RwLock<BackendConfig>,
    retry: RetryPolicy,
    options: GenerationOptions,
    session: GenerationSession,
    status: Mutex<StatusCell>,
    error_display: Duration,
    events: EventBus<GenerationEvent>,
    shutdown: CancellationToken,
}

impl GenerationOrchestrator {
    pub fn new(models: Arc<ModelManager>, config: BackendConfig, settings: &CoreSettings) -> Arc<Self> {
        Arc::new(Self {
            models,
            config: RwLock::new(config),
            retry: RetryPolicy::from(&settings.retry),
            options: GenerationOptions::default(),
            session: GenerationSession::new(),
            status: Mutex::new(StatusCell {
                status: GenerationStatus::Ready,
                failed_at: None,
            }),
            error_display: settings.status.error_display(),
            events: EventBus::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.events.subscribe()
    }

    pub fn models(&self) -> Arc<ModelManager> {
        self.models.clone()
    }

    pub async fn config(&self) -> BackendConfig {
        self.config.read().await.clone()
    }

    /// Replace the active configuration wholesale. Persisting it is the
    /// caller's job.
    pub async fn set_config(&self, config: BackendConfig) -> Result<(), GenerationError> {
        config.validate()?;
        *self.config.write().await = config;
        Ok(())
    }

    /// `Failed` reverts to `Ready` once the error display window passed.
    pub fn status(&self) -> GenerationStatus {
        let mut cell = self.status_cell();
        if let Some(failed_at) = cell.failed_at {
            if failed_at.elapsed() >= self.error_display {
                cell.status = GenerationStatus::Ready;
                cell.failed_at = None;
            }
        }
        cell.status.clone()
    }

    fn status_cell(&self) -> std::sync::MutexGuard<'_, StatusCell> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: GenerationStatus) {
        let mut cell = self.status_cell();
        cell.failed_at = match status {
            GenerationStatus::Failed { .. } => Some(Instant::now()),
            _ => None,
        };
        cell.status = status;
    }

    /// Cancel the running generation, if any.
    pub fn cancel(&self) -> bool {
        self.session.cancel()
    }

    /// Cancel everything, now and for good.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Turn one accepted clipboard change into a generation.
    ///
    /// Insignificant changes and content refused by [`sanitize`] produce
    /// `Ok(None)` without touching any backend.
    pub async fn handle_clipboard_change(
        &self,
        change: &ClipboardChangeEvent,
    ) -> Result<Option<GenerationResult>, GenerationError> {
        if !change.is_significant {
            return Ok(None);
        }
        let text = match sanitize(&change.new_value) {
            Ok(text) => text,
            Err(rejection) => {
                log::debug!("skipping clipboard content: {rejection}");
                return Ok(None);
            }
        };
        let prompt = build_prompt(change.content_type, &text);
        self.generate(prompt).await.map(Some)
    }

    /// Send a question typed by the user, verbatim apart from trimming.
    pub async fn submit_prompt(&self, prompt: &str) -> Result<GenerationResult, GenerationError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(GenerationError::BadRequest("prompt is empty".into()));
        }
        self.generate(prompt.to_string()).await
    }

    async fn route(&self, config: &BackendConfig) -> RouteDecision {
        let configured = self.models.readiness(config.backend, config).await;
        let (ollama, gemini) = match config.backend {
            BackendKind::Ollama => (configured, BackendReadiness::unprobed(BackendKind::Gemini)),
            BackendKind::Gemini if configured.is_ready() => {
                (BackendReadiness::unprobed(BackendKind::Ollama), configured)
            }
            BackendKind::Gemini => (
                self.models.readiness(BackendKind::Ollama, config).await,
                configured,
            ),
        };
        plan_route(config, &ollama, &gemini)
    }

    async fn generate(&self, prompt: String) -> Result<GenerationResult, GenerationError> {
        let request_id = Uuid::new_v4().to_string();
        let guard = self.session.begin(&request_id, &self.shutdown)?;
        let config = self.config().await;

        let kind = match self.route(&config).await {
            RouteDecision::Dispatch(kind) => kind,
            RouteDecision::Fallback { from, to, reason } => {
                log::warn!("falling back from {from} to {to}: {reason}");
                spawn_log_event(
                    &self.models.pool(),
                    "warn",
                    "GEN-0300",
                    "generation.routing",
                    "Backend fallback",
                    json!({ "from": from, "to": to, "reason": reason }),
                );
                self.events
                    .emit(GenerationEvent::BackendFallback { from, to, reason });
                to
            }
            RouteDecision::Reject(reason) => {
                let err = GenerationError::Validation(reason);
                self.report_failure(&err, None, 0);
                return Err(err);
            }
        };

        let backend = self.models.backend(kind);
        let model = if kind == config.backend {
            config.model_name.trim().to_string()
        } else {
            backend.model().await
        };
        let request = GenerationRequest {
            prompt,
            backend: kind,
            model: model.clone(),
            options: self.options.clone(),
            stream: true,
        };

        self.set_status(GenerationStatus::Generating {
            request_id: request_id.clone(),
            backend: kind,
            model: model.clone(),
        });
        self.events.emit(GenerationEvent::GenerationStarted {
            request_id,
            backend: kind,
            model: model.clone(),
        });

        let (sink, mut tokens) = TokenSink::channel();
        let cancel = guard.token();
        let timeout = self.models.timeout(kind);
        let attempts = AtomicU32::new(0);

        let request_ref = &request;
        let attempts_ref = &attempts;
        let retry = &self.retry;
        let cancel_ref = &cancel;
        let run = async move {
            let outcome = run_with_retry(retry, timeout, cancel_ref, &sink, |attempt| {
                attempts_ref.store(attempt.number, Ordering::SeqCst);
                let backend = backend.clone();
                let sink = sink.clone();
                async move { backend.generate(request_ref, &sink).await }
            })
            .await;
            drop(sink);
            outcome
        };
        let forward = async {
            let mut full_response = String::new();
            while let Some(token) = tokens.recv().await {
                full_response.push_str(&token);
                self.events.emit(GenerationEvent::TokenReceived {
                    token,
                    full_response: full_response.clone(),
                    done: false,
                });
            }
        };
        let (outcome, ()) = tokio::join!(run, forward);
        drop(guard);

        match outcome {
            Ok(result) => {
                self.events.emit(GenerationEvent::TokenReceived {
                    token: String::new(),
                    full_response: result.full_text.clone(),
                    done: true,
                });
                self.events.emit(GenerationEvent::GenerationCompleted {
                    full_response: result.full_text.clone(),
                    model: result.model.clone(),
                    finish_reason: result.finish_reason.clone(),
                    usage: result.usage.clone(),
                });
                self.models.record_success(kind, &result);
                self.set_status(GenerationStatus::Ready);
                Ok(result)
            }
            Err(err) => {
                self.models.record_failure(kind, &model, &err);
                let retry_count = attempts.load(Ordering::SeqCst).saturating_sub(1);
                self.report_failure(&err, Some(model), retry_count);
                Err(err)
            }
        }
    }

    fn report_failure(&self, err: &GenerationError, model: Option<String>, retry_count: u32) {
        log::warn!("generation failed ({}): {err}", err.code());
        self.events.emit(GenerationEvent::Error {
            kind: err.event_type().to_string(),
            error: err.to_string(),
            model,
            retry_count,
        });
        if err.kind() == ErrorKind::Cancelled {
            self.set_status(GenerationStatus::Ready);
        } else {
            self.set_status(GenerationStatus::Failed {
                error_type: err.event_type().to_string(),
                message: err.to_string(),
            });
        }
    }
}
