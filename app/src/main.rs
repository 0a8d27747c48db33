//! Clipwise command-line front-end.
//!
//! Parses arguments, sets up logging, builds the core [`ApiState`] and
//! forwards to `api::v1`. Streamed answers go to stdout; diagnostics and
//! status lines go to stderr.

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use tokio::sync::broadcast::{self, error::RecvError};

use clipwise_core::agents::BackendKind;
use clipwise_core::api::v1::{self, ApiState};
use clipwise_core::events::{GenerationEvent, MonitorEvent};
use clipwise_core::vault::GEMINI_API_KEY;

#[derive(Parser, Debug)]
#[command(name = "clipwise", version, about = "Clipboard-driven AI assistant")]
struct Args {
    /// Directory holding the database, settings and vault key file
    #[arg(long, global = true, env = "CLIPWISE_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Verbose logging (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the clipboard and stream an answer for every significant change
    Watch {
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Ask a question directly
    Ask {
        #[arg(required = true)]
        prompt: Vec<String>,
    },
    /// Show monitor, generation and vault status
    Status,
    /// List the models a backend offers
    Models {
        /// ollama or gemini; defaults to the configured backend
        kind: Option<BackendKind>,
    },
    /// Select the backend (and optionally the model)
    Backend {
        kind: BackendKind,
        #[arg(long)]
        model: Option<String>,
    },
    /// Manage the Gemini API key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Show recent diagnostic events
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// Store the key; read from stdin when no value is given
    Set {
        #[arg(env = "CLIPWISE_GEMINI_API_KEY", hide_env_values = true)]
        value: Option<String>,
        /// Check the key against the Gemini API before storing it
        #[arg(long)]
        test: bool,
    },
    Delete,
    /// Print an export envelope for a stored key
    Export {
        #[arg(long, default_value = GEMINI_API_KEY)]
        name: String,
    },
    /// Import an export envelope from a file, or stdin
    Import { file: Option<PathBuf> },
    /// Move a key from an environment variable into the vault
    Migrate {
        #[arg(long, default_value = "GEMINI_API_KEY")]
        env_var: String,
        #[arg(long, default_value = GEMINI_API_KEY)]
        name: String,
    },
}

fn workspace_dir(args: &Args) -> PathBuf {
    if let Some(dir) = &args.workspace {
        return dir.clone();
    }
    if let Some(proj) = ProjectDirs::from("com", "Clipwise", "Clipwise") {
        proj.data_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("Clipwise")
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("warn,clipwise_core={level},clipwise={level}"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let workspace = workspace_dir(&args);
    log::debug!("workspace: {}", workspace.display());
    let state = ApiState::bootstrap(&workspace)
        .await
        .with_context(|| format!("failed to start in {}", workspace.display()))?;

    let outcome = run(&state, args.command).await;
    state.shutdown().await;
    outcome
}

async fn run(state: &ApiState, command: Command) -> Result<()> {
    match command {
        Command::Watch { interval_ms } => watch(state, interval_ms).await,
        Command::Ask { prompt } => ask(state, prompt.join(" ")).await,
        Command::Status => print_json(&v1::status(state).await.map_err(|e| anyhow!(e))?),
        Command::Models { kind } => {
            let kind = match kind {
                Some(kind) => kind,
                None => v1::get_config(state).await.map_err(|e| anyhow!(e))?.backend,
            };
            print_json(&v1::list_models(state, kind).await.map_err(|e| anyhow!(e))?)
        }
        Command::Backend { kind, model } => {
            print_json(&v1::set_backend(state, kind, model).await.map_err(|e| anyhow!(e))?)
        }
        Command::Key { action } => key(state, action).await,
        Command::Events { limit } => {
            print_json(&v1::recent_events(state, Some(limit)).await.map_err(|e| anyhow!(e))?)
        }
    }
}

async fn key(state: &ApiState, action: KeyAction) -> Result<()> {
    match action {
        KeyAction::Set { value, test } => {
            let value = match value {
                Some(value) => value,
                None => read_stdin("API key")?,
            };
            let outcome = v1::set_api_key(state, value, test)
                .await
                .map_err(|e| anyhow!(e))?;
            print_json(&outcome)?;
            if !outcome.success {
                return Err(anyhow!("API key was not stored"));
            }
            Ok(())
        }
        KeyAction::Delete => {
            let removed = v1::delete_api_key(state).await.map_err(|e| anyhow!(e))?;
            eprintln!("{}", if removed { "API key deleted" } else { "no API key stored" });
            Ok(())
        }
        KeyAction::Export { name } => {
            println!("{}", v1::export_key(state, name).await.map_err(|e| anyhow!(e))?);
            Ok(())
        }
        KeyAction::Import { file } => {
            let blob = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => read_stdin("export envelope")?,
            };
            let name = v1::import_key(state, blob).await.map_err(|e| anyhow!(e))?;
            eprintln!("imported {name}");
            Ok(())
        }
        KeyAction::Migrate { env_var, name } => {
            print_json(&v1::migrate_key(state, name, env_var).await.map_err(|e| anyhow!(e))?)
        }
    }
}

async fn ask(state: &ApiState, prompt: String) -> Result<()> {
    let printer = tokio::spawn(print_stream(state.orchestrator.subscribe()));
    match v1::submit_prompt(state, prompt).await {
        Ok(_) => {
            let _ = printer.await;
            Ok(())
        }
        Err(err) => {
            printer.abort();
            Err(anyhow!(err))
        }
    }
}

/// Print one generation; returns after its terminal event.
async fn print_stream(mut events: broadcast::Receiver<GenerationEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let terminal = matches!(
                    event,
                    GenerationEvent::GenerationCompleted { .. } | GenerationEvent::Error { .. }
                );
                render_generation(&event);
                if terminal {
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => log::warn!("dropped {skipped} events"),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn watch(state: &ApiState, interval_ms: Option<u64>) -> Result<()> {
    let mut generation = state.orchestrator.subscribe();
    let mut monitor = state.monitor.subscribe();
    v1::start_monitoring(state, interval_ms)
        .await
        .map_err(|e| anyhow!(e))?;
    eprintln!("watching the clipboard, Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = generation.recv() => match event {
                Ok(event) => render_generation(&event),
                Err(RecvError::Lagged(skipped)) => log::warn!("dropped {skipped} generation events"),
                Err(RecvError::Closed) => break,
            },
            event = monitor.recv() => match event {
                Ok(MonitorEvent::ClipboardChanged(change)) => {
                    eprintln!("\n» {} ({} chars)", change.content_type.as_str(), change.length);
                }
                Ok(MonitorEvent::Error { message, fatal: true, .. }) => {
                    eprintln!("clipboard monitor stopped: {message}");
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => log::warn!("dropped {skipped} monitor events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    v1::stop_monitoring(state).await.map_err(|e| anyhow!(e))?;
    Ok(())
}

fn render_generation(event: &GenerationEvent) {
    match event {
        GenerationEvent::GenerationStarted { backend, model, .. } => {
            eprintln!("[{backend}/{model}]");
        }
        GenerationEvent::TokenReceived { token, done: false, .. } => {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(token.as_bytes());
            let _ = stdout.flush();
        }
        GenerationEvent::TokenReceived { .. } => {}
        GenerationEvent::GenerationCompleted { finish_reason, .. } => {
            println!();
            if let Some(reason) = finish_reason {
                log::debug!("finished: {reason}");
            }
        }
        GenerationEvent::BackendFallback { from, to, reason } => {
            eprintln!("using {to} instead of {from}: {reason}");
        }
        GenerationEvent::Error { kind, error, retry_count, .. } => {
            eprintln!("generation failed [{kind}] after {retry_count} retries: {error}");
        }
    }
}

fn read_stdin(what: &str) -> Result<String> {
    eprintln!("reading {what} from stdin");
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("failed to read stdin")?;
    let buf = buf.trim().to_string();
    if buf.is_empty() {
        return Err(anyhow!("no {what} given"));
    }
    Ok(buf)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
