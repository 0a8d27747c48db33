//! Central error catalogue.
//!
//! Every error that crosses a module boundary carries a stable machine code
//! (`code()`), a short human hint (`explain()`) and, for generation errors, an
//! [`ErrorKind`] tag that front-ends receive as the event `type`.

use serde::Serialize;
use thiserror::Error;

/// Coarse classification used for retry decisions and event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Configuration,
    Storage,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Configuration => "configuration",
            Self::Storage => "storage",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    /// Deadline in milliseconds, when the caller set one.
    #[error("{}", timeout_message(.0))]
    Timeout(Option<u64>),
    #[error("network error: {0}")]
    Network(String),
    #[error("backend returned HTTP {status}")]
    Server { status: u16 },
    #[error("rate limited by backend")]
    RateLimited,
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("API key was rejected by the backend")]
    InvalidApiKey,
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("unexpected stream payload: {0}")]
    Decode(String),
    #[error("backend validation failed: {0}")]
    Validation(String),
    #[error("a generation is already in progress")]
    Busy,
    #[error("generation cancelled")]
    Cancelled,
    #[error("all {attempts} attempts failed, last error: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<GenerationError>,
    },
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) | Self::Network(_) | Self::Server { .. } | Self::RateLimited => {
                ErrorKind::Transient
            }
            Self::ModelNotFound(_)
            | Self::InvalidApiKey
            | Self::BadRequest(_)
            | Self::Decode(_)
            | Self::Busy => ErrorKind::Permanent,
            Self::Validation(_) => ErrorKind::Configuration,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::RetriesExhausted { .. } => ErrorKind::Transient,
        }
    }

    /// Only transient failures of a single attempt are worth another try.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::RetriesExhausted { .. }) && self.kind() == ErrorKind::Transient
    }

    /// Event tag surfaced to front-ends.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "backend-validation-failed",
            Self::RetriesExhausted { .. } => "generation-failed",
            other => other.kind().as_str(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "GEN-1001",
            Self::Network(_) => "GEN-1002",
            Self::Server { .. } => "GEN-1003",
            Self::RateLimited => "GEN-1004",
            Self::ModelNotFound(_) => "GEN-2001",
            Self::InvalidApiKey => "GEN-2002",
            Self::BadRequest(_) => "GEN-2003",
            Self::Decode(_) => "GEN-2004",
            Self::Validation(_) => "GEN-3001",
            Self::Busy => "GEN-3002",
            Self::Cancelled => "GEN-3003",
            Self::RetriesExhausted { .. } => "GEN-1000",
        }
    }

    pub fn explain(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "The backend did not finish within the request timeout.",
            Self::Network(_) => "The backend could not be reached.",
            Self::Server { .. } => "The backend failed while handling the request.",
            Self::RateLimited => "The backend asked us to slow down.",
            Self::ModelNotFound(_) => "The configured model is not available on the backend.",
            Self::InvalidApiKey => "The stored API key is missing, malformed or revoked.",
            Self::BadRequest(_) => "The backend refused the request as malformed.",
            Self::Decode(_) => "The streamed response could not be decoded.",
            Self::Validation(_) => "The selected backend is not ready; nothing was sent.",
            Self::Busy => "Only one generation may run at a time.",
            Self::Cancelled => "The generation was cancelled before it finished.",
            Self::RetriesExhausted { .. } => "Every retry attempt failed.",
        }
    }
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("secure storage unavailable: {0}")]
    Keystore(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("stored value could not be decrypted")]
    Decrypt,
    #[error("vault persistence failed: {0}")]
    Persistence(String),
    #[error("no stored key named {0}")]
    NotFound(String),
    #[error("invalid key export: {0}")]
    InvalidExport(String),
}

impl VaultError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Keystore(_) => "VLT-1001",
            Self::Encrypt => "VLT-1002",
            Self::Decrypt => "VLT-1003",
            Self::Persistence(_) => "VLT-1004",
            Self::NotFound(_) => "VLT-1005",
            Self::InvalidExport(_) => "VLT-2001",
        }
    }

    pub fn explain(&self) -> &'static str {
        match self {
            Self::Keystore(_) => "The OS secret store could not provide the vault master key.",
            Self::Encrypt => "The value could not be sealed with the vault key.",
            Self::Decrypt => "The blob is corrupted or was sealed on another machine.",
            Self::Persistence(_) => "The local vault database could not be read or written.",
            Self::NotFound(_) => "Nothing is stored under that name.",
            Self::InvalidExport(_) => "The exported key blob is malformed or tampered with.",
        }
    }
}

impl From<r2d2::Error> for VaultError {
    fn from(err: r2d2::Error) -> Self {
        VaultError::Persistence(err.to_string())
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(err: rusqlite::Error) -> Self {
        VaultError::Persistence(err.to_string())
    }
}

fn timeout_message(deadline_ms: &Option<u64>) -> String {
    match deadline_ms {
        Some(ms) => format!("request timed out after {ms}ms"),
        None => "request timed out before the backend answered".to_string(),
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not say which of its deadlines fired.
            GenerationError::Timeout(None)
        } else if let Some(status) = err.status() {
            GenerationError::Server {
                status: status.as_u16(),
            }
        } else {
            GenerationError::Network(err.to_string())
        }
    }
}
