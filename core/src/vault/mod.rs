//! Encrypted-at-rest storage for API keys and the backend configuration.
//!
//! Every write seals the value before it reaches SQLite and every read opens
//! it right before returning. A blob that fails to open is reported as
//! absent, never as a partial value and never as a crash: callers degrade to
//! "not configured".

pub mod assessment;
pub mod cipher;
pub mod keystore;
pub mod store;
pub mod validation;

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::task::spawn_blocking;
use zeroize::Zeroizing;

use crate::db::DbPool;
use crate::errors::VaultError;
use crate::events::{EventBus, VaultEvent};
use crate::logging::{mask_secret, spawn_log_event};

pub use assessment::{assess, SecurityAssessment, SecurityLevel};
pub use cipher::SecretCipher;
pub use keystore::{FileKeystore, MasterKeyStore, StorageBackend, SystemKeyring};
pub use validation::{validate_format, FormatReport, GeminiKeyProbe, KeyProbe, RemoteCheck};

pub const GEMINI_API_KEY: &str = "gemini_api_key";
pub const BACKEND_CONFIG: &str = "backend_config";

const EXPORT_FORMAT: &str = "clipwise-key";
const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    /// Round-trip the key against the provider before persisting it.
    pub test_against_api: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub details: Option<FormatReport>,
}

impl StoreOutcome {
    fn stored(details: Option<FormatReport>) -> Self {
        Self {
            success: true,
            error: None,
            details,
        }
    }

    fn failed(error: impl Into<String>, details: Option<FormatReport>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    pub migrated: bool,
    pub reason: Option<String>,
}

impl MigrationOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            migrated: false,
            reason: Some(reason.into()),
        }
    }
}

/// Portable wrapper around an already-sealed blob.
#[derive(Debug, Serialize, Deserialize)]
struct ExportEnvelope {
    format: String,
    version: u32,
    name: String,
    blob: String,
    checksum: String,
}

pub struct CredentialVault {
    pool: DbPool,
    cipher: SecretCipher,
    storage_backend: StorageBackend,
    probe: Arc<dyn KeyProbe>,
    events: EventBus<VaultEvent>,
}

impl CredentialVault {
    /// Pick the best available keystore for this machine and open the vault.
    pub async fn initialize(
        pool: DbPool,
        workspace_dir: &Path,
        probe: Arc<dyn KeyProbe>,
    ) -> Result<Arc<Self>, VaultError> {
        let dir = workspace_dir.to_path_buf();
        let selected = spawn_blocking(move || keystore::select(&dir))
            .await
            .map_err(|err| VaultError::Keystore(err.to_string()))??;

        let vault = Self::build(pool, &selected.key, selected.store.backend(), probe)?;
        if let Some(reason) = selected.fallback_reason {
            spawn_log_event(
                &vault.pool,
                "warn",
                "VLT-0301",
                "vault.keystore",
                "Vault fell back to basic key storage",
                json!({ "reason": reason }),
            );
        }
        vault.announce();
        Ok(vault)
    }

    /// Open the vault on an explicit keystore.
    pub async fn open(
        pool: DbPool,
        store: Arc<dyn MasterKeyStore>,
        probe: Arc<dyn KeyProbe>,
    ) -> Result<Arc<Self>, VaultError> {
        let backend = store.backend();
        let key = spawn_blocking(move || keystore::load_or_create(store.as_ref()))
            .await
            .map_err(|err| VaultError::Keystore(err.to_string()))??;
        let vault = Self::build(pool, &key, backend, probe)?;
        vault.announce();
        Ok(vault)
    }

    fn build(
        pool: DbPool,
        key: &[u8],
        storage_backend: StorageBackend,
        probe: Arc<dyn KeyProbe>,
    ) -> Result<Arc<Self>, VaultError> {
        Ok(Arc::new(Self {
            pool,
            cipher: SecretCipher::from_key(key)?,
            storage_backend,
            probe,
            events: EventBus::new(),
        }))
    }

    fn announce(&self) {
        log::info!("vault ready ({})", self.storage_backend.as_str());
        self.events.emit(VaultEvent::Initialized {
            storage_backend: self.storage_backend.as_str().to_string(),
        });
        self.assess_platform_security();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.events.subscribe()
    }

    pub fn storage_backend(&self) -> StorageBackend {
        self.storage_backend
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, VaultError>
    where
        F: FnOnce(&Connection) -> Result<T, VaultError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|err| VaultError::Persistence(err.to_string()))?
    }

    async fn load_blob(&self, name: &str) -> Result<Option<String>, VaultError> {
        let name = name.to_string();
        self.with_conn(move |conn| store::get(conn, &name)).await
    }

    async fn decrypt(&self, name: &str) -> Result<Option<Zeroizing<String>>, VaultError> {
        match self.load_blob(name).await? {
            Some(blob) => self.cipher.open(name, &blob).map(Some),
            None => Ok(None),
        }
    }

    fn report_error(&self, operation: &str, err: &VaultError) {
        log::warn!("vault {operation} failed: {err}");
        self.events.emit(VaultEvent::Error {
            operation: operation.to_string(),
            message: err.to_string(),
        });
    }

    pub async fn store_key(&self, name: &str, value: &str, options: StoreOptions) -> StoreOutcome {
        let name = name.trim();
        if name.is_empty() {
            return StoreOutcome::failed("key name is empty", None);
        }
        if value.is_empty() {
            return StoreOutcome::failed("value is empty", None);
        }

        // Values are sealed byte for byte. Only the Gemini key is normalised,
        // and its format report carries the whitespace warning when it was.
        let mut details = None;
        let value = if name == GEMINI_API_KEY {
            let report = validate_format(value);
            if !report.is_valid {
                return StoreOutcome::failed("API key format is invalid", Some(report));
            }
            details = Some(report);
            Zeroizing::new(value.trim().to_string())
        } else {
            Zeroizing::new(value.to_string())
        };

        if options.test_against_api {
            let check = self.probe.probe(&value).await;
            if !check.is_valid {
                let error = check
                    .error
                    .unwrap_or_else(|| "the API key could not be verified".to_string());
                log::warn!("not storing {name}: live check failed ({error})");
                return StoreOutcome::failed(error, details);
            }
        }

        let blob = match self.cipher.seal(name, &value) {
            Ok(blob) => blob,
            Err(err) => {
                self.report_error("store-key", &err);
                return StoreOutcome::failed(err.to_string(), details);
            }
        };
        let entry = name.to_string();
        match self.with_conn(move |conn| store::put(conn, &entry, &blob)).await {
            Ok(()) => {
                spawn_log_event(
                    &self.pool,
                    "info",
                    "VLT-0100",
                    "vault",
                    "API key stored",
                    json!({ "name": name, "value": mask_secret(&value) }),
                );
                self.events.emit(VaultEvent::ApiKeyStored {
                    name: name.to_string(),
                });
                StoreOutcome::stored(details)
            }
            Err(err) => {
                self.report_error("store-key", &err);
                StoreOutcome::failed(err.to_string(), details)
            }
        }
    }

    /// Plaintext of `name`, or `None` when absent or unreadable.
    pub async fn retrieve_key(&self, name: &str) -> Option<Zeroizing<String>> {
        match self.decrypt(name).await {
            Ok(Some(value)) => {
                self.events.emit(VaultEvent::ApiKeyRetrieved {
                    name: name.to_string(),
                });
                Some(value)
            }
            Ok(None) => None,
            Err(err) => {
                self.report_error("retrieve-key", &err);
                None
            }
        }
    }

    pub async fn has_key(&self, name: &str) -> bool {
        matches!(self.decrypt(name).await, Ok(Some(_)))
    }

    /// True when something was removed.
    pub async fn delete_key(&self, name: &str) -> bool {
        let entry = name.to_string();
        match self.with_conn(move |conn| store::delete(conn, &entry)).await {
            Ok(removed) => {
                if removed {
                    spawn_log_event(
                        &self.pool,
                        "info",
                        "VLT-0101",
                        "vault",
                        "API key deleted",
                        json!({ "name": name }),
                    );
                    self.events.emit(VaultEvent::ApiKeyDeleted {
                        name: name.to_string(),
                    });
                }
                removed
            }
            Err(err) => {
                self.report_error("delete-key", &err);
                false
            }
        }
    }

    /// Names of stored keys, excluding the backend configuration.
    pub async fn key_names(&self) -> Vec<String> {
        match self.with_conn(store::names).await {
            Ok(names) => names.into_iter().filter(|n| n != BACKEND_CONFIG).collect(),
            Err(err) => {
                self.report_error("list-keys", &err);
                Vec::new()
            }
        }
    }

    /// Replace the stored configuration wholesale.
    pub async fn store_config<T: Serialize>(&self, config: &T) -> bool {
        let json = match serde_json::to_string(config) {
            Ok(json) => Zeroizing::new(json),
            Err(err) => {
                log::warn!("backend config not serialisable: {err}");
                return false;
            }
        };
        let blob = match self.cipher.seal(BACKEND_CONFIG, &json) {
            Ok(blob) => blob,
            Err(err) => {
                self.report_error("store-config", &err);
                return false;
            }
        };
        match self
            .with_conn(move |conn| store::put(conn, BACKEND_CONFIG, &blob))
            .await
        {
            Ok(()) => {
                self.events.emit(VaultEvent::BackendConfigStored);
                true
            }
            Err(err) => {
                self.report_error("store-config", &err);
                false
            }
        }
    }

    pub async fn retrieve_config<T: DeserializeOwned>(&self) -> Option<T> {
        let json = match self.decrypt(BACKEND_CONFIG).await {
            Ok(Some(json)) => json,
            Ok(None) => return None,
            Err(err) => {
                self.report_error("retrieve-config", &err);
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(config) => {
                self.events.emit(VaultEvent::BackendConfigRetrieved);
                Some(config)
            }
            Err(err) => {
                log::warn!("stored backend config is not readable: {err}");
                None
            }
        }
    }

    pub fn validate_format(&self, value: &str) -> FormatReport {
        validate_format(value)
    }

    pub async fn test_against_remote(&self, value: &str) -> RemoteCheck {
        self.probe.probe(value).await
    }

    /// Move a key from an environment variable into the vault.
    ///
    /// Skipped when a key of that name already exists or when the value fails
    /// the format check.
    pub async fn migrate_from_environment(&self, name: &str, env_var: &str) -> MigrationOutcome {
        if self.has_key(name).await {
            return MigrationOutcome::skipped(format!("a key named {name} is already stored"));
        }
        let value = match std::env::var(env_var) {
            Ok(value) if !value.trim().is_empty() => Zeroizing::new(value),
            _ => return MigrationOutcome::skipped(format!("{env_var} is not set")),
        };
        if name == GEMINI_API_KEY {
            let report = validate_format(&value);
            if !report.is_valid {
                return MigrationOutcome::skipped(format!(
                    "value of {env_var} failed validation: {}",
                    report.errors.join("; ")
                ));
            }
        }

        let outcome = self.store_key(name, &value, StoreOptions::default()).await;
        if !outcome.success {
            return MigrationOutcome::skipped(
                outcome
                    .error
                    .unwrap_or_else(|| "the key could not be stored".to_string()),
            );
        }

        spawn_log_event(
            &self.pool,
            "info",
            "VLT-0102",
            "vault",
            "API key migrated from environment",
            json!({ "name": name, "env_var": env_var }),
        );
        self.events.emit(VaultEvent::ApiKeyMigrated {
            name: name.to_string(),
            env_var: env_var.to_string(),
        });
        MigrationOutcome {
            migrated: true,
            reason: None,
        }
    }

    /// Wrap the sealed blob of `name` for transfer. Nothing is decrypted.
    pub async fn export_key(&self, name: &str) -> Result<String, VaultError> {
        let blob = self
            .load_blob(name)
            .await?
            .ok_or_else(|| VaultError::NotFound(name.to_string()))?;
        let envelope = ExportEnvelope {
            format: EXPORT_FORMAT.to_string(),
            version: EXPORT_VERSION,
            name: name.to_string(),
            checksum: checksum(&blob),
            blob,
        };
        let exported = serde_json::to_string(&envelope)
            .map_err(|err| VaultError::InvalidExport(err.to_string()))?;

        spawn_log_event(
            &self.pool,
            "info",
            "VLT-0103",
            "vault",
            "API key exported",
            json!({ "name": name }),
        );
        self.events.emit(VaultEvent::ApiKeyExported {
            name: name.to_string(),
        });
        Ok(exported)
    }

    /// Store an exported blob unchanged, after checking it opens here.
    /// Returns the entry name.
    pub async fn import_key(&self, exported: &str) -> Result<String, VaultError> {
        let result = self.import_envelope(exported).await;
        if let Err(err) = &result {
            self.report_error("import-key", err);
        }
        result
    }

    async fn import_envelope(&self, exported: &str) -> Result<String, VaultError> {
        let envelope: ExportEnvelope = serde_json::from_str(exported.trim())
            .map_err(|_| VaultError::InvalidExport("not a clipwise key export".into()))?;
        if envelope.format != EXPORT_FORMAT {
            return Err(VaultError::InvalidExport(format!(
                "unexpected format {:?}",
                envelope.format
            )));
        }
        if envelope.version != EXPORT_VERSION {
            return Err(VaultError::InvalidExport(format!(
                "unsupported version {}",
                envelope.version
            )));
        }
        if envelope.name.trim().is_empty() {
            return Err(VaultError::InvalidExport("entry name is empty".into()));
        }
        if checksum(&envelope.blob) != envelope.checksum.to_ascii_lowercase() {
            return Err(VaultError::InvalidExport("checksum mismatch".into()));
        }

        // Must open under this machine's key, otherwise we would persist garbage.
        drop(self.cipher.open(&envelope.name, &envelope.blob)?);

        let name = envelope.name.clone();
        let blob = envelope.blob;
        self.with_conn(move |conn| store::put(conn, &name, &blob))
            .await?;

        spawn_log_event(
            &self.pool,
            "info",
            "VLT-0104",
            "vault",
            "API key imported",
            json!({ "name": envelope.name }),
        );
        self.events.emit(VaultEvent::ApiKeyImported {
            name: envelope.name.clone(),
        });
        Ok(envelope.name)
    }

    /// Re-derive the assessment for the keystore in use and publish it.
    pub fn assess_platform_security(&self) -> SecurityAssessment {
        let assessment = assess(self.storage_backend);
        self.events
            .emit(VaultEvent::SecurityAssessment(assessment.clone()));
        if assessment.is_degraded() {
            for warning in &assessment.warnings {
                log::warn!("vault security: {warning}");
                self.events.emit(VaultEvent::SecurityWarning {
                    message: warning.clone(),
                });
            }
            spawn_log_event(
                &self.pool,
                "warn",
                "VLT-0300",
                "vault.security",
                "Vault is running with degraded secret storage",
                json!({
                    "storage_backend": self.storage_backend.as_str(),
                    "warnings": assessment.warnings,
                }),
            );
        }
        assessment
    }
}

fn checksum(blob: &str) -> String {
    hex::encode(Sha256::digest(blob.as_bytes()))
}
