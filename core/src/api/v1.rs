//! Version 1 of the command surface.
//!
//! Commands are thin wrappers that validate input, run blocking work on the
//! blocking pool and return JSON-friendly payloads. Errors are flattened to
//! strings so any front-end can show them as-is.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::{spawn_blocking, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::agents::{BackendConfig, BackendKind, CredentialSource, GenerationResult, ModelInfo};
use crate::clipboard::{ClipboardMonitor, ClipboardSource, MonitorStatus, SystemClipboard};
use crate::db::{init_db, DbPool};
use crate::logging::{recent_events as query_recent_events, EventLogEntry};
use crate::model_manager::ModelManager;
use crate::orchestrator::{pipeline, GenerationOrchestrator, GenerationStatus};
use crate::settings::CoreSettings;
use crate::vault::{
    CredentialVault, GeminiKeyProbe, MigrationOutcome, SecurityLevel, StorageBackend,
    StoreOptions, StoreOutcome, GEMINI_API_KEY,
};

struct PipelineHandle {
    cancel: CancellationToken,
    task: JoinHandle<usize>,
}

/// Shared state handed to every command.
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub settings: Arc<CoreSettings>,
    pub vault: Arc<CredentialVault>,
    pub monitor: Arc<ClipboardMonitor>,
    pub models: Arc<ModelManager>,
    pub orchestrator: Arc<GenerationOrchestrator>,
    pipeline: Arc<Mutex<Option<PipelineHandle>>>,
}

impl ApiState {
    /// Wire every subsystem against the OS clipboard.
    pub async fn bootstrap(workspace_dir: &Path) -> anyhow::Result<Self> {
        Self::bootstrap_with(workspace_dir, Arc::new(SystemClipboard::new())).await
    }

    pub async fn bootstrap_with(
        workspace_dir: &Path,
        clipboard: Arc<dyn ClipboardSource>,
    ) -> anyhow::Result<Self> {
        let settings = CoreSettings::load(workspace_dir)?;
        let db = init_db(workspace_dir.to_path_buf()).context("failed to open database")?;

        let probe = GeminiKeyProbe::new(&settings.gemini.base_url)?;
        let vault = CredentialVault::initialize(db.clone(), workspace_dir, Arc::new(probe))
            .await
            .context("failed to open credential vault")?;
        let config: BackendConfig = vault.retrieve_config().await.unwrap_or_default();

        let credentials: Arc<dyn CredentialSource> = vault.clone();
        let models = ModelManager::new(db.clone(), &settings, credentials)?;
        models
            .backend(config.backend)
            .set_model(&config.model_name)
            .await;
        let orchestrator = GenerationOrchestrator::new(models.clone(), config, &settings);
        let monitor = ClipboardMonitor::new(clipboard, settings.monitor.clone());

        Ok(Self {
            db,
            settings: Arc::new(settings),
            vault,
            monitor,
            models,
            orchestrator,
            pipeline: Arc::new(Mutex::new(None)),
        })
    }

    /// Stop monitoring and abort whatever is in flight.
    pub async fn shutdown(&self) {
        let _ = stop_monitoring(self).await;
        self.orchestrator.shutdown();
    }
}

/// Liveness probe.
pub fn ping() -> serde_json::Value {
    serde_json::json!({
        "ok": true,
        "ts": OffsetDateTime::now_utc().unix_timestamp(),
    })
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub monitor: MonitorStatus,
    pub generation: GenerationStatus,
    pub backend: BackendKind,
    pub model: String,
    pub storage_backend: StorageBackend,
    pub security_level: SecurityLevel,
    pub stored_keys: Vec<String>,
}

pub async fn status(state: &ApiState) -> Result<StatusView, String> {
    let config = state.orchestrator.config().await;
    let assessment = crate::vault::assess(state.vault.storage_backend());
    Ok(StatusView {
        monitor: state.monitor.status().await,
        generation: state.orchestrator.status(),
        backend: config.backend,
        model: config.model_name,
        storage_backend: assessment.storage_backend,
        security_level: assessment.security_level,
        stored_keys: state.vault.key_names().await,
    })
}

/// Start the monitor and the pipeline feeding the orchestrator.
/// False when monitoring was already running.
pub async fn start_monitoring(state: &ApiState, interval_ms: Option<u64>) -> Result<bool, String> {
    let mut pipeline = state.pipeline.lock().await;
    if pipeline.is_none() {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pipeline::run(
            state.monitor.subscribe(),
            state.orchestrator.clone(),
            cancel.clone(),
        ));
        *pipeline = Some(PipelineHandle { cancel, task });
    }
    let interval = interval_ms.unwrap_or(state.settings.monitor.initial_interval_ms);
    Ok(state.monitor.start(interval).await)
}

pub async fn stop_monitoring(state: &ApiState) -> Result<bool, String> {
    let stopped = state.monitor.stop().await;
    if let Some(handle) = state.pipeline.lock().await.take() {
        handle.cancel.cancel();
        match handle.task.await {
            Ok(handled) => log::info!("pipeline stopped after {handled} clipboard changes"),
            Err(err) => log::warn!("pipeline task ended abnormally: {err}"),
        }
    }
    Ok(stopped)
}

pub async fn get_config(state: &ApiState) -> Result<BackendConfig, String> {
    Ok(state.orchestrator.config().await)
}

/// Select `kind` (and optionally a model) and persist the result.
pub async fn set_backend(
    state: &ApiState,
    kind: BackendKind,
    model: Option<String>,
) -> Result<BackendConfig, String> {
    let backend = state.models.backend(kind);
    let model = match model.map(|m| m.trim().to_string()).filter(|m| !m.is_empty()) {
        Some(model) => model,
        None => backend.model().await,
    };
    let config = state
        .orchestrator
        .config()
        .await
        .with_backend(kind, model.clone());
    state
        .orchestrator
        .set_config(config.clone())
        .await
        .map_err(|err| err.to_string())?;
    backend.set_model(&model).await;
    if !state.vault.store_config(&config).await {
        return Err("configuration applied but could not be saved".to_string());
    }
    Ok(config)
}

pub async fn set_api_key(
    state: &ApiState,
    value: String,
    test_against_api: bool,
) -> Result<StoreOutcome, String> {
    let outcome = state
        .vault
        .store_key(GEMINI_API_KEY, &value, StoreOptions { test_against_api })
        .await;
    if outcome.success {
        state.models.backend(BackendKind::Gemini).initialize().await;
    }
    Ok(outcome)
}

pub async fn delete_api_key(state: &ApiState) -> Result<bool, String> {
    Ok(state.vault.delete_key(GEMINI_API_KEY).await)
}

pub async fn list_models(state: &ApiState, kind: BackendKind) -> Result<Vec<ModelInfo>, String> {
    state
        .models
        .list_models(kind)
        .await
        .map_err(|err| err.to_string())
}

pub async fn submit_prompt(state: &ApiState, text: String) -> Result<GenerationResult, String> {
    state
        .orchestrator
        .submit_prompt(&text)
        .await
        .map_err(|err| err.to_string())
}

pub async fn export_key(state: &ApiState, name: String) -> Result<String, String> {
    state
        .vault
        .export_key(&name)
        .await
        .map_err(|err| err.to_string())
}

pub async fn import_key(state: &ApiState, blob: String) -> Result<String, String> {
    let name = state
        .vault
        .import_key(&blob)
        .await
        .map_err(|err| err.to_string())?;
    if name == GEMINI_API_KEY {
        state.models.backend(BackendKind::Gemini).initialize().await;
    }
    Ok(name)
}

pub async fn migrate_key(
    state: &ApiState,
    name: String,
    env_var: String,
) -> Result<MigrationOutcome, String> {
    Ok(state.vault.migrate_from_environment(&name, &env_var).await)
}

pub async fn recent_events(state: &ApiState, limit: Option<usize>) -> Result<Vec<EventLogEntry>, String> {
    let pool = state.db.clone();
    let limit = limit.unwrap_or(50).min(1_000);
    spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        query_recent_events(&conn, limit).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| e.to_string())?
}
