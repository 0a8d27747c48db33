//! The user's persisted backend selection.
//!
//! One instance per process, loaded from the vault at start-up and replaced
//! wholesale on save. The Gemini key itself is never part of this object;
//! `gemini_api_key_ref` only names the vault entry holding it.

use serde::{Deserialize, Serialize};

use super::backend::BackendKind;
use crate::errors::GenerationError;
use crate::vault::GEMINI_API_KEY;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub backend: BackendKind,
    pub model_name: String,
    pub gemini_api_key_ref: String,
    pub position: String,
    pub theme: String,
    pub auto_hide: bool,
    pub auto_hide_delay: u64,
    pub auto_hide_after_response: bool,
    pub auto_hide_delay_after_response: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Ollama,
            model_name: "llama3.2".to_string(),
            gemini_api_key_ref: GEMINI_API_KEY.to_string(),
            position: "top-right".to_string(),
            theme: "system".to_string(),
            auto_hide: false,
            auto_hide_delay: 5_000,
            auto_hide_after_response: false,
            auto_hide_delay_after_response: 10_000,
        }
    }
}

impl BackendConfig {
    /// Configuration problems that must stop a dispatch before any network call.
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.model_name.trim().is_empty() {
            return Err(GenerationError::Validation(format!(
                "no model selected for {}",
                self.backend
            )));
        }
        if self.backend == BackendKind::Gemini && self.gemini_api_key_ref.trim().is_empty() {
            return Err(GenerationError::Validation(
                "no vault entry configured for the Gemini API key".into(),
            ));
        }
        Ok(())
    }

    pub fn with_backend(mut self, backend: BackendKind, model_name: impl Into<String>) -> Self {
        self.backend = backend;
        self.model_name = model_name.into();
        self
    }
}
