//! Cloud backend client (Gemini generative language API).
//!
//! `:streamGenerateContent` answers with a JSON array that arrives in
//! arbitrary slices, so objects are cut out of the byte stream with
//! [`JsonObjectScanner`] before decoding. The API key travels in the
//! `x-goog-api-key` header and is fetched from the [`CredentialSource`] for
//! every request; the client never keeps it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use super::backend::{
    BackendKind, GenerationBackend, GenerationRequest, GenerationResult, ModelInfo, TokenSink, Usage,
};
use super::stream::JsonObjectScanner;
use crate::errors::GenerationError;
use crate::logging::preview;
use crate::settings::GeminiSettings;
use crate::vault::{CredentialVault, GEMINI_API_KEY};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Supplies the API key at request time.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn api_key(&self) -> Option<Zeroizing<String>>;
}

#[async_trait]
impl CredentialSource for CredentialVault {
    async fn api_key(&self) -> Option<Zeroizing<String>> {
        self.retrieve_key(GEMINI_API_KEY).await
    }
}

/// Fixed key, for tests and one-shot CLI use.
pub struct StaticCredential(Option<Zeroizing<String>>);

impl StaticCredential {
    pub fn new(key: Option<String>) -> Self {
        Self(key.map(Zeroizing::new))
    }
}

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn api_key(&self) -> Option<Zeroizing<String>> {
        self.0.clone()
    }
}

pub struct GeminiClient {
    http: Client,
    base_url: String,
    timeout: Duration,
    model: RwLock<String>,
    initialized: AtomicBool,
    credentials: Arc<dyn CredentialSource>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    name: String,
    description: Option<String>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    total_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<u16>,
    message: Option<String>,
    status: Option<String>,
}

impl GeminiClient {
    pub fn new(settings: &GeminiSettings, credentials: Arc<dyn CredentialSource>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(PROBE_TIMEOUT)
            .user_agent("Clipwise-Core/0.1")
            .build()
            .context("failed to construct HTTP client")?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(settings.timeout_secs),
            model: RwLock::new(settings.default_model.clone()),
            initialized: AtomicBool::new(false),
            credentials,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn require_key(&self) -> Result<Zeroizing<String>, GenerationError> {
        self.credentials
            .api_key()
            .await
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| GenerationError::Validation("no Gemini API key configured".into()))
    }

    async fn fetch_models(&self) -> Result<Vec<ModelInfo>, GenerationError> {
        let key = self.require_key().await?;
        let response = self
            .http
            .get(format!("{}/models", self.base_url))
            .header(API_KEY_HEADER, key.as_str())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        let response = check_status(response, "").await?;
        let listing: ModelsResponse = response
            .json()
            .await
            .map_err(|err| GenerationError::Decode(err.to_string()))?;
        Ok(listing
            .models
            .into_iter()
            .filter(|m| {
                m.supported_generation_methods.is_empty()
                    || m
                        .supported_generation_methods
                        .iter()
                        .any(|method| method == "generateContent")
            })
            .map(|m| ModelInfo {
                name: strip_models_prefix(&m.name).to_string(),
                size: None,
                modified_at: None,
                description: m.description,
            })
            .collect())
    }
}

#[async_trait]
impl GenerationBackend for GeminiClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Gemini
    }

    async fn initialize(&self) -> bool {
        let ok = self.has_credentials().await && self.check_connection().await;
        self.initialized.store(ok, Ordering::SeqCst);
        ok
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn check_connection(&self) -> bool {
        match self.fetch_models().await {
            Ok(_) => true,
            Err(err) => {
                log::debug!("gemini connection check failed: {}", err.code());
                false
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, GenerationError> {
        self.fetch_models().await
    }

    async fn set_model(&self, name: &str) {
        *self.model.write().await = strip_models_prefix(name.trim()).to_string();
    }

    async fn model(&self) -> String {
        self.model.read().await.clone()
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        sink: &TokenSink,
    ) -> Result<GenerationResult, GenerationError> {
        let key = self.require_key().await?;
        let model = strip_models_prefix(&request.model);
        let method = if request.stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
            "generationConfig": {
                "temperature": request.options.temperature,
                "topP": request.options.top_p,
                "maxOutputTokens": request.options.max_tokens,
            },
        });
        let response = self
            .http
            .post(format!("{}/models/{}:{}", self.base_url, model, method))
            .header(API_KEY_HEADER, key.as_str())
            .json(&body)
            .send()
            .await?;
        drop(key);
        let response = check_status(response, model).await?;
        let mut result = GenerationResult::new(model);

        if !request.stream {
            let chunk: GenerateChunk = response
                .json()
                .await
                .map_err(|err| GenerationError::Decode(err.to_string()))?;
            apply_chunk(chunk, &mut result, sink)?;
            result.finish(result.finish_reason.clone(), result.usage.clone());
            return Ok(result);
        }

        let mut stream = response.bytes_stream();
        let mut scanner = JsonObjectScanner::new();
        while let Some(bytes) = stream.next().await {
            let bytes = bytes?;
            for object in scanner.push(&bytes) {
                apply_object(&object, &mut result, sink)?;
            }
        }
        if scanner.has_partial() {
            return Err(GenerationError::Network(
                "stream closed inside a JSON object".into(),
            ));
        }
        result.finish(result.finish_reason.clone(), result.usage.clone());
        Ok(result)
    }

    async fn validate_model(&self, name: &str) -> bool {
        let wanted = strip_models_prefix(name.trim());
        if wanted.is_empty() {
            return false;
        }
        match self.fetch_models().await {
            Ok(models) => models.iter().any(|m| m.name == wanted),
            Err(err) => {
                log::debug!("gemini model validation failed: {}", err.code());
                false
            }
        }
    }

    async fn health_check(&self) -> bool {
        let model = self.model().await;
        self.validate_model(&model).await
    }

    async fn has_credentials(&self) -> bool {
        self.require_key().await.is_ok()
    }
}

fn strip_models_prefix(name: &str) -> &str {
    name.strip_prefix("models/").unwrap_or(name)
}

fn apply_object(
    object: &str,
    result: &mut GenerationResult,
    sink: &TokenSink,
) -> Result<(), GenerationError> {
    let chunk: GenerateChunk =
        serde_json::from_str(object).map_err(|err| GenerationError::Decode(err.to_string()))?;
    apply_chunk(chunk, result, sink)
}

/// Fold one response object into the result. Metadata is kept from the last
/// object that carried it; `finish` is left to the caller.
fn apply_chunk(
    chunk: GenerateChunk,
    result: &mut GenerationResult,
    sink: &TokenSink,
) -> Result<(), GenerationError> {
    if let Some(error) = chunk.error {
        return Err(api_error(&error, error.code.unwrap_or(500)));
    }
    for candidate in chunk.candidates {
        if let Some(content) = candidate.content {
            for text in content.parts.into_iter().filter_map(|p| p.text) {
                sink.send(&text);
                result.push_token(&text);
            }
        }
        if candidate.finish_reason.is_some() {
            result.finish_reason = candidate.finish_reason;
        }
    }
    if let Some(usage) = chunk.usage_metadata {
        result.usage = Some(Usage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
        });
    }
    if let Some(version) = chunk.model_version {
        result.model = version;
    }
    Ok(())
}

fn api_error(error: &ApiError, status: u16) -> GenerationError {
    let message = error.message.clone().unwrap_or_default();
    let status_tag = error.status.as_deref().unwrap_or_default();
    classify_failure(status, &message, status_tag, "")
}

fn classify_failure(status: u16, message: &str, raw_body: &str, model: &str) -> GenerationError {
    let key_rejected = raw_body.contains("API_KEY_INVALID")
        || message.contains("API key not valid")
        || message.contains("API_KEY_INVALID");
    match status {
        400 if key_rejected => GenerationError::InvalidApiKey,
        401 | 403 => GenerationError::InvalidApiKey,
        404 => GenerationError::ModelNotFound(model.to_string()),
        400 => GenerationError::BadRequest(preview(message, 200)),
        429 => GenerationError::RateLimited,
        s if (500..600).contains(&s) => GenerationError::Server { status: s },
        s => GenerationError::BadRequest(format!("HTTP {s}")),
    }
}

async fn check_status(response: Response, model: &str) -> Result<Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(GenerationError::ModelNotFound(model.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    Err(classify_failure(status.as_u16(), &message, &body, model))
}
