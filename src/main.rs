//! roamr - A terminal travel-assistant chat backed by a local LLM server.
//!
//! Finds the configured model on the backend, loads it, and streams replies
//! into the conversation token by token.

mod backend;
mod chat;
mod config;
mod error;
mod tui;

use anyhow::{bail, Context, Result};
use backend::{create_backend, Backend, GenerationOptions, InferenceBackend};
use chat::{ChatController, ChatState};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::process::Command as ProcessCommand;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "roamr")]
#[command(author, version, about = "Chat with a local LLM from your terminal")]
#[command(long_about = "Chat with a local LLM from your terminal.\n\nRun without arguments to open the chat screen.")]
struct Cli {
    /// Override the model from config (exact name as listed by the backend)
    #[arg(short = 'm', long, value_name = "MODEL", global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the chat screen (default)
    Chat,
    /// Ask a single question and print the answer
    Ask {
        /// The prompt to send
        #[arg(value_name = "PROMPT", required = true)]
        prompt: Vec<String>,
        /// Print tokens as they arrive
        #[arg(short, long)]
        stream: bool,
    },
    /// Inspect and download backend models
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },
    /// Open configuration file in $EDITOR
    Config,
}

#[derive(Subcommand)]
enum ModelsAction {
    /// List models known to the backend
    List,
    /// Pull/download a model from the Ollama registry
    Pull {
        /// Model name (e.g., smollm2:360m, llama3.2:1b)
        model: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config) => handle_config(),
        Some(Commands::Models { action }) => {
            init_logging(false)?;
            handle_models(action, load_config(None)?).await
        }
        Some(Commands::Ask { prompt, stream }) => {
            init_logging(false)?;
            handle_ask(load_config(cli.model)?, prompt.join(" "), stream).await
        }
        Some(Commands::Chat) | None => {
            init_logging(true)?;
            handle_chat(load_config(cli.model)?).await
        }
    }
}

fn load_config(model: Option<String>) -> Result<config::Config> {
    Ok(config::Config::load()
        .context("Failed to load configuration")?
        .with_model(model))
}

const DEFAULT_LOG_FILTER: &str = "roamr=info,reqwest=warn";

/// `RUST_LOG` directives when set and valid, the defaults otherwise.
fn log_filter(from_env: Option<&str>) -> Result<EnvFilter> {
    let directives = from_env.filter(|d| !d.trim().is_empty());
    match directives.map(EnvFilter::try_new) {
        Some(Ok(filter)) => Ok(filter),
        _ => Ok(EnvFilter::try_new(DEFAULT_LOG_FILTER)?),
    }
}

/// Install the tracing subscriber.
///
/// The chat screen owns the terminal, so it logs to a file; everything else
/// logs to stderr and keeps stdout for answers.
fn init_logging(to_file: bool) -> Result<()> {
    let filter = log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())?;

    if to_file {
        let path = config::Config::log_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(())
}

fn build_backend(config: &config::Config) -> Result<Arc<Backend>> {
    create_backend(&config.backend, GenerationOptions::from(&config.chat))
        .with_context(|| format!("Failed to create {} backend", config.backend_type()))
}

/// Run the interactive chat screen.
async fn handle_chat(config: config::Config) -> Result<()> {
    info!(
        "Starting chat (backend: {} at {}, model: {})",
        config.backend_type(),
        config.host(),
        config.model_name()
    );

    let backend = build_backend(&config)?;
    let controller = Arc::new(ChatController::new(backend));
    let model = config.model_name().to_string();
    let runtime = tokio::runtime::Handle::current();

    tokio::task::block_in_place(move || tui::run_chat(controller, model, runtime))
}

/// Handle one-shot question mode.
async fn handle_ask(config: config::Config, prompt: String, stream: bool) -> Result<()> {
    let backend = build_backend(&config)?;
    let controller = Arc::new(ChatController::new(backend));

    controller
        .initialize(config.model_name())
        .await
        .with_context(|| {
            format!(
                "Model '{}' is not ready on {} ({})",
                config.model_name(),
                config.backend_type(),
                config.host()
            )
        })?;

    if !stream {
        let reply = controller.generate(&prompt).await?;
        println!("{}", reply.trim_end());
        return Ok(());
    }

    let base = controller.transcript().len();
    let mut updates = controller.subscribe();
    let mut task = tokio::spawn({
        let chat = Arc::clone(&controller);
        async move { chat.send_message(&prompt).await }
    });

    let mut stdout = std::io::stdout();
    let mut printed = 0;
    let outcome = loop {
        tokio::select! {
            result = &mut task => break result,
            changed = updates.changed() => {
                if changed.is_err() {
                    break (&mut task).await;
                }
                let text = reply_text(&updates.borrow_and_update(), base);
                printed = print_delta(&mut stdout, text.as_deref(), printed)?;
            }
        }
    };
    let text = reply_text(&controller.snapshot(), base);
    print_delta(&mut stdout, text.as_deref(), printed)?;
    writeln!(stdout)?;

    outcome.context("Generation task failed")??;
    Ok(())
}

/// The streamed reply to the message appended at index `base`, if any.
fn reply_text(state: &ChatState, base: usize) -> Option<String> {
    if state.last_error.is_some() {
        return None;
    }
    state
        .transcript
        .messages()
        .get(base + 1)
        .filter(|m| !m.is_user)
        .map(|m| m.text.clone())
}

/// Print whatever part of `text` has not been printed yet.
fn print_delta(out: &mut impl Write, text: Option<&str>, printed: usize) -> Result<usize> {
    match text {
        Some(text) if text.len() > printed => {
            write!(out, "{}", &text[printed..])?;
            out.flush()?;
            Ok(text.len())
        }
        _ => Ok(printed),
    }
}

/// Handle models subcommand.
async fn handle_models(action: ModelsAction, config: config::Config) -> Result<()> {
    let backend = build_backend(&config)?;

    match action {
        ModelsAction::List => list_models(backend.as_ref(), &config).await,
        ModelsAction::Pull { model } => match backend.as_ref() {
            Backend::Ollama(ollama) => pull_model(ollama, &model).await,
            _ => bail!(
                "Pulling models is only supported by the Ollama backend (configured: {})",
                config.backend_type()
            ),
        },
    }
}

/// List the backend's models, marking the configured one.
async fn list_models(backend: &Backend, config: &config::Config) -> Result<()> {
    let models = backend.list_models().await.with_context(|| {
        format!(
            "Failed to list models from {} at {}. Is it running?",
            backend.name(),
            config.host()
        )
    })?;

    println!("Available Models");
    println!("================\n");

    if models.is_empty() {
        println!("No models installed.");
        if matches!(backend, Backend::Ollama(_)) {
            println!("\nPull a model with: roamr models pull <model>");
            println!("Example: roamr models pull {}", config.model_name());
        }
        return Ok(());
    }

    for model in &models {
        let size = model
            .size_bytes
            .map(format_size)
            .unwrap_or_else(|| "?".to_string());
        let state = if model.is_downloaded { "downloaded" } else { "remote" };
        let marker = if model.name == config.model_name() {
            " (configured)"
        } else {
            ""
        };
        println!("  {} ({}) - {}{}", model.name, size, state, marker);
    }

    Ok(())
}

/// Format bytes to human-readable size.
fn format_size(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;

    if bytes >= GB {
        format!("{:.1}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.0}MB", bytes as f64 / MB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Pull/download a model through Ollama.
async fn pull_model(backend: &backend::ollama::OllamaBackend, model: &str) -> Result<()> {
    println!("Pulling model: {}", model);
    println!("This may take a while depending on model size...\n");

    let progress = backend
        .pull(model)
        .await
        .context("Failed to start pull. Is Ollama running?")?;
    futures::pin_mut!(progress);

    let mut last_status = String::new();
    let mut stdout = std::io::stdout();

    while let Some(update) = progress.next().await {
        let update = update.context("Pull failed")?;
        match (update.completed, update.total) {
            (Some(completed), Some(total)) if total > 0 => {
                // Update progress on same line
                let pct = (completed as f64 / total as f64 * 100.0) as u32;
                print!(
                    "\r{}: {}% ({}/{})",
                    update.status,
                    pct,
                    format_size(completed),
                    format_size(total)
                );
                stdout.flush()?;
            }
            _ if update.status != last_status => println!("\n{}", update.status),
            _ => {}
        }
        last_status = update.status;
    }

    println!("\n\nModel '{}' pulled successfully!", model);
    Ok(())
}

/// Handle the config command.
fn handle_config() -> Result<()> {
    let config_path = config::Config::config_path()?;

    // Create default config if it doesn't exist
    if !config_path.exists() {
        let default_config = config::Config::default();
        default_config.save()?;
        println!("Created default config at {}", config_path.display());
    }

    // Open in editor
    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let status = ProcessCommand::new(&editor)
        .arg(&config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        eprintln!("Editor exited with non-zero status");
    }

    Ok(())
}
