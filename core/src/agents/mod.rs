//! Generation backends and everything needed to talk to them.
//!
//! Both clients implement [`GenerationBackend`]; callers pick one through
//! [`BackendKind`] rather than by provider name.

pub mod backend;
pub mod config;
pub mod gemini;
pub mod ollama;
pub mod prompt;
pub mod retry;
pub mod stream;

pub use backend::{
    BackendKind, GenerationBackend, GenerationOptions, GenerationRequest, GenerationResult,
    ModelInfo, TokenSink, Usage,
};
pub use config::BackendConfig;
pub use gemini::{CredentialSource, GeminiClient, StaticCredential};
pub use ollama::OllamaClient;
pub use prompt::{build_prompt, sanitize, ContentRejection};
pub use retry::{run_with_retry, Attempt, RetryPolicy};
