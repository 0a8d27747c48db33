//! API key checks: a static format check and an optional live probe.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

const GEMINI_KEY_PREFIX: &str = "AIza";
const GEMINI_KEY_LEN: usize = 39;
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteCheck {
    pub is_valid: bool,
    pub error: Option<String>,
}

impl RemoteCheck {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error: Some(error.into()),
        }
    }
}

/// Static shape check for a Gemini API key. Never echoes the value.
pub fn validate_format(value: &str) -> FormatReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if value != value.trim() {
        warnings.push("surrounding whitespace will be removed".to_string());
    }
    let key = value.trim();

    if key.is_empty() {
        errors.push("API key is empty".to_string());
    } else {
        if !key.starts_with(GEMINI_KEY_PREFIX) {
            errors.push(format!("API key must start with \"{GEMINI_KEY_PREFIX}\""));
        }
        let len = key.chars().count();
        if len < GEMINI_KEY_LEN {
            errors.push(format!(
                "API key is too short ({len} characters, expected at least {GEMINI_KEY_LEN})"
            ));
        } else if len > GEMINI_KEY_LEN {
            warnings.push(format!(
                "API key is {len} characters long; Gemini keys are usually {GEMINI_KEY_LEN}"
            ));
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            errors.push("API key contains characters outside [A-Za-z0-9_-]".to_string());
        }
    }

    FormatReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Live round-trip against the provider.
#[async_trait]
pub trait KeyProbe: Send + Sync {
    async fn probe(&self, key: &str) -> RemoteCheck;
}

/// Lists models with the candidate key; any 2xx means the key works.
pub struct GeminiKeyProbe {
    http: Client,
    base_url: String,
}

impl GeminiKeyProbe {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .user_agent("Clipwise-Core/0.1")
            .build()
            .context("failed to construct HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl KeyProbe for GeminiKeyProbe {
    async fn probe(&self, key: &str) -> RemoteCheck {
        let response = self
            .http
            .get(format!("{}/models", self.base_url))
            .header("x-goog-api-key", key.trim())
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => RemoteCheck::valid(),
            Ok(response) => match response.status() {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    RemoteCheck::invalid("the API key was rejected by Gemini")
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    RemoteCheck::invalid("Gemini is rate limiting requests; try again later")
                }
                status => RemoteCheck::invalid(format!(
                    "Gemini answered HTTP {} while checking the key",
                    status.as_u16()
                )),
            },
            Err(err) if err.is_timeout() => {
                RemoteCheck::invalid("timed out while contacting Gemini to check the key")
            }
            Err(err) => RemoteCheck::invalid(format!(
                "could not reach Gemini to check the key: {}",
                err.without_url()
            )),
        }
    }
}
