//! Hearth CLI - run one conversation turn from the terminal
//!
//! Usage:
//!   hearth --project p1 --user u1 "build a todo app"   Run a turn
//!   hearth --project p1 --terminate                    Snapshot and stop the sandbox
//!
//! History is loaded from the project store, the new turn is streamed to
//! stdout, and logs go to stderr. Ctrl-C cancels the turn after the current
//! tool call finishes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use hearth::model::AnthropicModel;
use hearth::sidecar::{Sidecar, SidecarClient};
use hearth::{HearthConfig, HttpProjectStore, Message, Orchestrator, TurnEvent, TurnRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "hearth", about = "Build apps in a remote sandbox by chatting with an agent")]
struct Args {
    /// Project (and sandbox) id.
    #[arg(long, env = "HEARTH_PROJECT_ID")]
    project: String,

    /// User id the turn is saved under.
    #[arg(long, env = "HEARTH_USER_ID", default_value = "local")]
    user: String,

    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the sidecar URL.
    #[arg(long)]
    sidecar_url: Option<String>,

    /// Override the project store URL.
    #[arg(long)]
    store_url: Option<String>,

    /// Override the model id.
    #[arg(long)]
    model: Option<String>,

    /// Override the step cap.
    #[arg(long)]
    max_steps: Option<usize>,

    /// Snapshot and terminate the project's sandbox instead of running a turn.
    #[arg(long)]
    terminate: bool,

    /// The message to send.
    message: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut HearthConfig) {
        if let Some(url) = &self.sidecar_url {
            config.sidecar_url = url.clone();
        }
        if let Some(url) = &self.store_url {
            config.store_url = url.clone();
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(max_steps) = self.max_steps {
            config.max_steps = max_steps;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they don't interleave with the streamed turn
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let mut config = HearthConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    tracing::debug!(?config, "configuration loaded");

    let sidecar = Arc::new(SidecarClient::new(
        config.sidecar_url.clone(),
        config.request_timeout(),
    )?);

    if args.terminate {
        sidecar
            .terminate(&args.project)
            .await
            .with_context(|| format!("failed to terminate sandbox {}", args.project))?;
        println!("sandbox {} terminated", args.project);
        return Ok(());
    }

    let Some(text) = args.message.clone() else {
        bail!("a message is required unless --terminate is given");
    };

    let store = Arc::new(HttpProjectStore::new(
        config.store_url.clone(),
        config.request_timeout(),
    )?);
    let model = AnthropicModel::new(
        config.anthropic_api_key.clone().unwrap_or_default(),
        config.model.clone(),
    )
    .context("set ANTHROPIC_API_KEY or anthropic_api_key in the config file")?
    .with_base_url(config.anthropic_base_url.clone())
    .with_max_tokens(config.max_tokens)
    .with_timeout(config.request_timeout())?;

    let orchestrator = Orchestrator::builder(Arc::new(model), sidecar, store)
        .max_steps(config.max_steps)
        .preview_policy(config.preview_policy())
        .build();

    let mut messages = match orchestrator.load_history(&args.project).await {
        Ok(messages) => messages,
        Err(e) => {
            tracing::warn!(project_id = %args.project, error = %e, "could not load history, starting fresh");
            Vec::new()
        }
    };
    messages.push(Message::user(text));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling turn");
            on_interrupt.cancel();
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(rx));

    let result = orchestrator
        .run_turn(
            TurnRequest::new(args.user.clone(), args.project.clone(), messages),
            &cancel,
            Some(&tx),
        )
        .await;
    drop(tx);
    printer.await?;

    let outcome = result?;
    tracing::info!(
        input_tokens = outcome.usage.input_tokens,
        output_tokens = outcome.usage.output_tokens,
        "turn complete"
    );
    Ok(())
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<TurnEvent>) {
    while let Some(event) = rx.recv().await {
        if let Some(line) = render(event) {
            println!("{line}");
        }
    }
}

/// The stdout line for an event. Step bookkeeping only goes to the log.
fn render(event: TurnEvent) -> Option<String> {
    match event {
        TurnEvent::StepStarted { step } => {
            tracing::debug!(step, "model step");
            None
        }
        TurnEvent::Reasoning { text } => Some(format!("(thinking) {text}")),
        TurnEvent::Text { text } => Some(text),
        TurnEvent::ToolCall { tool, input, .. } => Some(format!("> {tool} {input}")),
        TurnEvent::ToolResult {
            tool,
            output,
            error,
            ..
        } => Some(match (output, error) {
            (_, Some(error)) => format!("< {tool} failed: {error}"),
            (Some(output), None) => match output.get("error").and_then(|e| e.as_str()) {
                Some(refusal) => format!("< {tool} refused: {refusal}"),
                None => format!("< {tool} {}", summarize(&output)),
            },
            (None, None) => format!("< {tool}"),
        }),
        TurnEvent::Finished { reason, steps } => {
            tracing::info!(?reason, steps, "turn finished");
            None
        }
    }
}

/// One-line summary of a tool result.
fn summarize(output: &serde_json::Value) -> String {
    if let Some(url) = output.get("previewUrl").and_then(|u| u.as_str()) {
        return format!("preview at {url}");
    }
    let text = output.to_string();
    match text.char_indices().nth(120) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text,
    }
}
