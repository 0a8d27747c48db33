//! Registry of the generation backends.
//!
//! The manager owns one client per [`BackendKind`], answers readiness
//! questions for the router and records every invocation outcome in the
//! event log so failures can be diagnosed after the fact.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::task::spawn_blocking;

use crate::agents::{
    BackendConfig, BackendKind, CredentialSource, GeminiClient, GenerationBackend,
    GenerationResult, ModelInfo, OllamaClient,
};
use crate::db::DbPool;
use crate::errors::GenerationError;
use crate::logging::{log_event, preview};
use crate::settings::CoreSettings;

/// Snapshot of what the router needs to know about one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendReadiness {
    pub kind: BackendKind,
    pub initialized: bool,
    pub connected: bool,
    pub credential_present: bool,
    pub model: String,
}

impl BackendReadiness {
    /// Placeholder for a backend nobody probed.
    pub fn unprobed(kind: BackendKind) -> Self {
        Self {
            kind,
            initialized: false,
            connected: false,
            credential_present: false,
            model: String::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.initialized && self.connected && self.credential_present && !self.model.is_empty()
    }

    /// First unmet requirement, in the order a user would fix them.
    pub fn blocker(&self) -> Option<String> {
        if !self.credential_present {
            Some(format!("no API key stored for {}", self.kind))
        } else if !self.initialized {
            Some(format!("{} is not initialized", self.kind))
        } else if !self.connected {
            Some(format!("{} is not reachable", self.kind))
        } else if self.model.is_empty() {
            Some(format!("no model selected for {}", self.kind))
        } else {
            None
        }
    }
}

pub struct ModelManager {
    pool: DbPool,
    ollama: Arc<dyn GenerationBackend>,
    gemini: Arc<dyn GenerationBackend>,
    ollama_timeout: Duration,
    gemini_timeout: Duration,
}

impl ModelManager {
    /// Build both HTTP clients from settings.
    pub fn new(
        pool: DbPool,
        settings: &CoreSettings,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Arc<Self>> {
        let ollama = OllamaClient::new(&settings.ollama)?;
        let gemini = GeminiClient::new(&settings.gemini, credentials)?;
        Ok(Self::with_backends(
            pool,
            Arc::new(ollama),
            Arc::new(gemini),
            settings,
        ))
    }

    /// Explicit wiring, mostly for tests.
    pub fn with_backends(
        pool: DbPool,
        ollama: Arc<dyn GenerationBackend>,
        gemini: Arc<dyn GenerationBackend>,
        settings: &CoreSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            ollama,
            gemini,
            ollama_timeout: Duration::from_secs(settings.ollama.timeout_secs),
            gemini_timeout: Duration::from_secs(settings.gemini.timeout_secs),
        })
    }

    pub fn pool(&self) -> DbPool {
        self.pool.clone()
    }

    pub fn backend(&self, kind: BackendKind) -> Arc<dyn GenerationBackend> {
        match kind {
            BackendKind::Ollama => self.ollama.clone(),
            BackendKind::Gemini => self.gemini.clone(),
        }
    }

    /// Per-attempt deadline for `kind`.
    pub fn timeout(&self, kind: BackendKind) -> Duration {
        match kind {
            BackendKind::Ollama => self.ollama_timeout,
            BackendKind::Gemini => self.gemini_timeout,
        }
    }

    /// Probe every backend once; used at start-up.
    pub async fn initialize_all(&self) -> Vec<(BackendKind, bool)> {
        let mut outcome = Vec::with_capacity(BackendKind::ALL.len());
        for kind in BackendKind::ALL {
            let ok = self.backend(kind).initialize().await;
            log::info!("{kind} backend initialized: {ok}");
            outcome.push((kind, ok));
        }
        outcome
    }

    /// Check `kind`, initializing it lazily when an earlier attempt failed.
    ///
    /// An initialized cloud backend is trusted without another model
    /// listing; a dead connection then surfaces through the generation
    /// retry path. The local backend is re-checked on every call.
    ///
    /// The configured model wins for the configured backend; any other
    /// backend reports the model its client currently holds.
    pub async fn readiness(&self, kind: BackendKind, config: &BackendConfig) -> BackendReadiness {
        let backend = self.backend(kind);
        let credential_present = backend.has_credentials().await;
        let (initialized, connected) = if backend.is_initialized() && !kind.is_local() {
            (true, true)
        } else if backend.is_initialized() {
            (true, backend.check_connection().await)
        } else {
            let ok = backend.initialize().await;
            (ok, ok)
        };
        let model = if config.backend == kind && !config.model_name.trim().is_empty() {
            config.model_name.trim().to_string()
        } else {
            backend.model().await
        };
        BackendReadiness {
            kind,
            initialized,
            connected,
            credential_present,
            model,
        }
    }

    pub async fn list_models(&self, kind: BackendKind) -> Result<Vec<ModelInfo>, GenerationError> {
        self.backend(kind).list_models().await
    }

    /// Point `kind` at `name`; refuses models the backend does not serve.
    pub async fn set_model(&self, kind: BackendKind, name: &str) -> Result<(), GenerationError> {
        let backend = self.backend(kind);
        if !backend.validate_model(name).await {
            return Err(GenerationError::ModelNotFound(name.trim().to_string()));
        }
        backend.set_model(name).await;
        Ok(())
    }

    pub fn record_success(&self, kind: BackendKind, result: &GenerationResult) {
        log_invocation_success(&self.pool, kind, result);
    }

    pub fn record_failure(&self, kind: BackendKind, model: &str, error: &GenerationError) {
        log_invocation_failure(&self.pool, kind, model, error);
    }
}

fn log_invocation_success(pool: &DbPool, kind: BackendKind, result: &GenerationResult) {
    let pool = pool.clone();
    let data = serde_json::json!({
        "backend": kind,
        "model": result.model,
        "finish_reason": result.finish_reason,
        "usage": result.usage,
        "preview": preview(&result.full_text, 200),
    });
    spawn_blocking(move || {
        if let Ok(conn) = pool.get() {
            let _ = log_event(
                &conn,
                "info",
                Some("GEN-0200"),
                "generation.runtime",
                "Generation completed",
                Some("The backend streamed a full response"),
                Some(data),
            );
        }
    });
}

fn log_invocation_failure(pool: &DbPool, kind: BackendKind, model: &str, error: &GenerationError) {
    let pool = pool.clone();
    let data = serde_json::json!({
        "backend": kind,
        "model": model,
        "code": error.code(),
        "type": error.event_type(),
        "error": error.to_string(),
    });
    let explain = error.explain();
    spawn_blocking(move || {
        if let Ok(conn) = pool.get() {
            let _ = log_event(
                &conn,
                "warn",
                Some("GEN-0201"),
                "generation.runtime",
                "Generation failed",
                Some(explain),
                Some(data),
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(kind: BackendKind) -> BackendReadiness {
        BackendReadiness {
            kind,
            initialized: true,
            connected: true,
            credential_present: true,
            model: "m".into(),
        }
    }

    #[test]
    fn readiness_needs_every_requirement() {
        assert!(ready(BackendKind::Ollama).is_ready());
        assert_eq!(ready(BackendKind::Ollama).blocker(), None);

        let mut no_key = ready(BackendKind::Gemini);
        no_key.credential_present = false;
        no_key.initialized = false;
        assert!(!no_key.is_ready());
        assert_eq!(no_key.blocker().as_deref(), Some("no API key stored for gemini"));

        let mut no_model = ready(BackendKind::Ollama);
        no_model.model.clear();
        assert_eq!(no_model.blocker().as_deref(), Some("no model selected for ollama"));
        assert!(!BackendReadiness::unprobed(BackendKind::Ollama).is_ready());
    }
}
