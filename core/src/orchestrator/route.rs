//! Backend selection as a pure function of configuration and readiness.

use serde::Serialize;

use crate::agents::{BackendConfig, BackendKind};
use crate::errors::GenerationError;
use crate::model_manager::BackendReadiness;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum RouteDecision {
    Dispatch(BackendKind),
    /// Recoverable substitution; reported as `backend-fallback`, not as an error.
    Fallback {
        from: BackendKind,
        to: BackendKind,
        reason: String,
    },
    /// Nothing usable. Surfaces as `backend-validation-failed`.
    Reject(String),
}

/// Only the cloud backend may fall back, and only onto the local one.
pub fn plan_route(
    config: &BackendConfig,
    ollama: &BackendReadiness,
    gemini: &BackendReadiness,
) -> RouteDecision {
    match config.validate() {
        Ok(()) => {}
        Err(GenerationError::Validation(reason)) => return RouteDecision::Reject(reason),
        Err(other) => return RouteDecision::Reject(other.to_string()),
    }

    match config.backend {
        BackendKind::Ollama => {
            if ollama.is_ready() {
                RouteDecision::Dispatch(BackendKind::Ollama)
            } else {
                RouteDecision::Reject(blocker(ollama))
            }
        }
        BackendKind::Gemini => {
            if gemini.is_ready() {
                return RouteDecision::Dispatch(BackendKind::Gemini);
            }
            let reason = blocker(gemini);
            if ollama.is_ready() {
                RouteDecision::Fallback {
                    from: BackendKind::Gemini,
                    to: BackendKind::Ollama,
                    reason,
                }
            } else {
                RouteDecision::Reject(format!("{reason}; {}", blocker(ollama)))
            }
        }
    }
}

fn blocker(readiness: &BackendReadiness) -> String {
    readiness
        .blocker()
        .unwrap_or_else(|| format!("{} is unavailable", readiness.kind))
}
