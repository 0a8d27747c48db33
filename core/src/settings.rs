//! Runtime tuning loaded from `clipwise.toml` in the workspace directory.
//!
//! Every field has a default so a missing or partial file is fine. The
//! user's backend/model selection is *not* stored here; that lives in the
//! vault as [`crate::agents::BackendConfig`].

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::clipboard::SignificancePolicy;

pub const SETTINGS_FILE: &str = "clipwise.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreSettings {
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub ollama: OllamaSettings,
    #[serde(default)]
    pub gemini: GeminiSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub status: StatusSettings,
}

impl CoreSettings {
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid clipwise settings")
    }

    /// Load `<workspace>/clipwise.toml`, falling back to defaults when absent,
    /// then apply environment overrides.
    pub fn load(workspace_dir: &Path) -> Result<Self> {
        let path = workspace_dir.join(SETTINGS_FILE);
        let mut settings = match std::fs::read_to_string(&path) {
            Ok(raw) => Self::from_toml(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CLIPWISE_OLLAMA_URL") {
            if !url.trim().is_empty() {
                self.ollama.base_url = url;
            }
        }
        if let Ok(url) = std::env::var("CLIPWISE_GEMINI_URL") {
            if !url.trim().is_empty() {
                self.gemini.base_url = url;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Lower bound between two clipboard reads, whatever the interval.
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_min_change_interval_ms")]
    pub min_change_interval_ms: u64,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Idle time after which the poll interval starts growing.
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,
    /// Activity this recent shrinks the interval.
    #[serde(default = "default_active_threshold_ms")]
    pub active_threshold_ms: u64,
    /// Accepted changes per minute above which polling speeds up further.
    #[serde(default = "default_high_change_rate")]
    pub high_change_rate_per_min: usize,
    #[serde(default = "default_pause_after_ms")]
    pub pause_after_ms: u64,
    #[serde(default = "default_resume_within_ms")]
    pub resume_within_ms: u64,
    #[serde(default = "default_optimize_every_ms")]
    pub optimize_every_ms: u64,
    #[serde(default = "default_read_retries")]
    pub max_read_retries: u32,
    #[serde(default = "default_read_retry_base_ms")]
    pub read_retry_base_ms: u64,
    #[serde(default)]
    pub significance: SignificancePolicy,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_interval_ms(),
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            rate_limit_ms: default_rate_limit_ms(),
            debounce_ms: default_debounce_ms(),
            min_change_interval_ms: default_min_change_interval_ms(),
            min_length: default_min_length(),
            max_length: default_max_length(),
            idle_threshold_ms: default_idle_threshold_ms(),
            active_threshold_ms: default_active_threshold_ms(),
            high_change_rate_per_min: default_high_change_rate(),
            pause_after_ms: default_pause_after_ms(),
            resume_within_ms: default_resume_within_ms(),
            optimize_every_ms: default_optimize_every_ms(),
            max_read_retries: default_read_retries(),
            read_retry_base_ms: default_read_retry_base_ms(),
            significance: SignificancePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaSettings {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_ollama_model")]
    pub default_model: String,
    #[serde(default = "default_ollama_timeout")]
    pub timeout_secs: u64,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            default_model: default_ollama_model(),
            timeout_secs: default_ollama_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiSettings {
    #[serde(default = "default_gemini_url")]
    pub base_url: String,
    #[serde(default = "default_gemini_model")]
    pub default_model: String,
    #[serde(default = "default_gemini_timeout")]
    pub timeout_secs: u64,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            base_url: default_gemini_url(),
            default_model: default_gemini_model(),
            timeout_secs: default_gemini_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_retry_base_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSettings {
    /// How long a failure stays visible before status returns to ready.
    #[serde(default = "default_error_display_ms")]
    pub error_display_ms: u64,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            error_display_ms: default_error_display_ms(),
        }
    }
}

impl StatusSettings {
    pub fn error_display(&self) -> Duration {
        Duration::from_millis(self.error_display_ms)
    }
}

fn default_interval_ms() -> u64 {
    500
}
fn default_min_interval_ms() -> u64 {
    100
}
fn default_max_interval_ms() -> u64 {
    2_000
}
fn default_rate_limit_ms() -> u64 {
    50
}
fn default_debounce_ms() -> u64 {
    100
}
fn default_min_change_interval_ms() -> u64 {
    500
}
fn default_min_length() -> usize {
    3
}
fn default_max_length() -> usize {
    10_000
}
fn default_idle_threshold_ms() -> u64 {
    10_000
}
fn default_active_threshold_ms() -> u64 {
    2_000
}
fn default_high_change_rate() -> usize {
    10
}
fn default_pause_after_ms() -> u64 {
    30_000
}
fn default_resume_within_ms() -> u64 {
    5_000
}
fn default_optimize_every_ms() -> u64 {
    5_000
}
fn default_read_retries() -> u32 {
    3
}
fn default_read_retry_base_ms() -> u64 {
    250
}
fn default_ollama_url() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_ollama_model() -> String {
    "llama3.2".to_string()
}
fn default_ollama_timeout() -> u64 {
    120
}
fn default_gemini_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_gemini_model() -> String {
    "gemini-1.5-flash".to_string()
}
fn default_gemini_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_error_display_ms() -> u64 {
    5_000
}
