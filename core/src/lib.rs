//! Core library for Clipwise: clipboard in, streamed AI answers out.
//!
//! Module map:
//! - [`clipboard`] polls the OS clipboard and publishes accepted changes.
//! - [`agents`] holds the backend clients (Ollama, Gemini), stream parsers,
//!   retry policy, prompt templates and the persisted backend selection.
//! - [`model_manager`] owns the backend clients and reports their readiness.
//! - [`orchestrator`] routes each request, streams tokens and handles fallback.
//! - [`vault`] keeps API keys and configuration encrypted at rest.
//! - [`api`] exposes the command surface front-ends call.
//! - [`db`] initialises the SQLite database and applies migrations.
//! - [`errors`] keeps the central error catalogue with human friendly metadata.
//! - [`events`] defines the event buses front-ends subscribe to.
//! - [`logging`] writes structured diagnostics to the event log table.
//! - [`settings`] loads runtime tuning from `clipwise.toml`.

pub mod agents;
pub mod api;
pub mod clipboard;
pub mod db;
pub mod errors;
pub mod events;
pub mod logging;
pub mod model_manager;
pub mod orchestrator;
pub mod settings;
pub mod vault;
