//! Local model server client (Ollama HTTP API).
//!
//! `/api/generate` streams newline-delimited JSON, one `{response, done}`
//! fragment per line; the final line carries `done_reason` and token counts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use super::backend::{
    BackendKind, GenerationBackend, GenerationRequest, GenerationResult, ModelInfo, TokenSink, Usage,
};
use super::stream::LineBuffer;
use crate::errors::GenerationError;
use crate::settings::OllamaSettings;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct OllamaClient {
    http: Client,
    base_url: String,
    timeout: Duration,
    model: RwLock<String>,
    initialized: AtomicBool,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    size: Option<u64>,
    modified_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateChunk {
    model: Option<String>,
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
    error: Option<String>,
}

impl OllamaClient {
    pub fn new(settings: &OllamaSettings) -> Result<Self> {
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
        })
    }

    /// Per-attempt deadline for generation calls.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn fetch_tags(&self) -> Result<Vec<ModelInfo>, GenerationError> {
        let response = self
            .http
            .get(self.url("/api/tags"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        let response = check_status(response, "").await?;
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|err| GenerationError::Decode(err.to_string()))?;
        Ok(tags
            .models
            .into_iter()
            .map(|entry| ModelInfo {
                name: entry.name,
                size: entry.size,
                modified_at: entry.modified_at,
                description: None,
            })
            .collect())
    }
}

#[async_trait]
impl GenerationBackend for OllamaClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
    }

    async fn initialize(&self) -> bool {
        let ok = self.check_connection().await;
        self.initialized.store(ok, Ordering::SeqCst);
        if !ok {
            log::warn!("ollama not reachable at {}", self.base_url);
        }
        ok
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn check_connection(&self) -> bool {
        match self
            .http
            .get(self.url("/api/tags"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                log::debug!("ollama connection check failed: {err}");
                false
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, GenerationError> {
        self.fetch_tags().await
    }

    async fn set_model(&self, name: &str) {
        *self.model.write().await = name.trim().to_string();
    }

    async fn model(&self) -> String {
        self.model.read().await.clone()
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        sink: &TokenSink,
    ) -> Result<GenerationResult, GenerationError> {
        let body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": request.stream,
            "options": {
                "temperature": request.options.temperature,
                "top_p": request.options.top_p,
                "num_predict": request.options.max_tokens,
            },
        });
        let response = self
            .http
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await?;
        let response = check_status(response, &request.model).await?;
        let mut result = GenerationResult::new(request.model.clone());

        if !request.stream {
            let chunk: GenerateChunk = response
                .json()
                .await
                .map_err(|err| GenerationError::Decode(err.to_string()))?;
            apply_chunk(chunk, &mut result, sink)?;
            if !result.done {
                result.finish(None, None);
            }
            return Ok(result);
        }

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::new();
        while let Some(bytes) = stream.next().await {
            let bytes = bytes?;
            for line in lines.push(&bytes) {
                apply_line(&line, &mut result, sink)?;
            }
            if result.done {
                break;
            }
        }
        if let Some(line) = lines.finish() {
            apply_line(&line, &mut result, sink)?;
        }

        if !result.done {
            return Err(GenerationError::Network(
                "stream closed before completion".into(),
            ));
        }
        Ok(result)
    }

    async fn validate_model(&self, name: &str) -> bool {
        let wanted = name.trim();
        if wanted.is_empty() {
            return false;
        }
        match self.fetch_tags().await {
            Ok(models) => models.iter().any(|m| model_matches(&m.name, wanted)),
            Err(err) => {
                log::debug!("ollama model validation failed: {err}");
                false
            }
        }
    }

    async fn health_check(&self) -> bool {
        let model = self.model().await;
        self.check_connection().await && self.validate_model(&model).await
    }

    async fn has_credentials(&self) -> bool {
        true
    }
}

/// `llama3.2` matches an installed `llama3.2:latest`.
fn model_matches(installed: &str, wanted: &str) -> bool {
    installed == wanted
        || installed
            .strip_suffix(":latest")
            .is_some_and(|base| base == wanted)
}

fn apply_line(
    line: &str,
    result: &mut GenerationResult,
    sink: &TokenSink,
) -> Result<(), GenerationError> {
    let chunk: GenerateChunk =
        serde_json::from_str(line).map_err(|err| GenerationError::Decode(err.to_string()))?;
    apply_chunk(chunk, result, sink)
}

fn apply_chunk(
    chunk: GenerateChunk,
    result: &mut GenerationResult,
    sink: &TokenSink,
) -> Result<(), GenerationError> {
    if let Some(message) = chunk.error {
        return Err(GenerationError::Network(message));
    }
    if !chunk.response.is_empty() {
        sink.send(&chunk.response);
        result.push_token(&chunk.response);
    }
    if let Some(model) = chunk.model {
        result.model = model;
    }
    if chunk.done {
        let usage = match (chunk.prompt_eval_count, chunk.eval_count) {
            (None, None) => None,
            (prompt, completion) => Some(Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: Some(prompt.unwrap_or(0) + completion.unwrap_or(0)),
            }),
        };
        result.finish(chunk.done_reason.or_else(|| Some("stop".into())), usage);
    }
    Ok(())
}

async fn check_status(response: Response, model: &str) -> Result<Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    Err(match status {
        StatusCode::NOT_FOUND => GenerationError::ModelNotFound(model.to_string()),
        StatusCode::BAD_REQUEST => GenerationError::BadRequest(message),
        StatusCode::TOO_MANY_REQUESTS => GenerationError::RateLimited,
        s if s.is_server_error() => GenerationError::Server { status: s.as_u16() },
        _ => GenerationError::BadRequest(message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_tag_is_implied() {
        assert!(model_matches("llama3.2:latest", "llama3.2"));
        assert!(model_matches("llama3.2:3b", "llama3.2:3b"));
        assert!(!model_matches("llama3.2:3b", "llama3.2"));
    }

    #[tokio::test]
    async fn ndjson_lines_accumulate_and_finish() {
        let (sink, mut rx) = TokenSink::channel();
        let mut result = GenerationResult::new("llama3.2");
        apply_line(r#"{"model":"llama3.2","response":"Hi","done":false}"#, &mut result, &sink)
            .expect("line");
        apply_line(
            r#"{"model":"llama3.2","response":" there","done":false}"#,
            &mut result,
            &sink,
        )
        .expect("line");
        apply_line(
            r#"{"model":"llama3.2","response":"","done":true,"done_reason":"stop","prompt_eval_count":5,"eval_count":2}"#,
            &mut result,
            &sink,
        )
        .expect("line");
        assert_eq!(result.full_text, "Hi there");
        assert!(result.done);
        assert_eq!(result.usage.as_ref().and_then(|u| u.total_tokens), Some(7));
        assert_eq!(rx.recv().await.as_deref(), Some("Hi"));
        assert_eq!(rx.recv().await.as_deref(), Some(" there"));
    }

    #[test]
    fn error_line_becomes_transient_failure() {
        let mut result = GenerationResult::new("llama3.2");
        let err = apply_line(r#"{"error":"runner crashed"}"#, &mut result, &TokenSink::discard())
            .expect_err("error line");
        assert!(err.is_retryable());
    }

    #[test]
    fn garbage_line_is_a_decode_error() {
        let mut result = GenerationResult::new("llama3.2");
        let err = apply_line("not json", &mut result, &TokenSink::discard()).expect_err("garbage");
        assert!(matches!(err, GenerationError::Decode(_)));
    }
}
