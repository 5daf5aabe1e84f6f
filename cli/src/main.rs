//! ferret-client - editor host for the Ferret language client.
//!
//! Plays the editor's part of the extension contract:
//!
//! ```text
//! main() -> activate() -> Activation::ready() -> event loop -> deactivate()
//!                                                   |
//!                     stdin (EditorEvent JSON lines) + file watcher
//!                                                   v
//!                              stdout (SessionEvent JSON lines)
//! ```
//!
//! Ctrl-C, end of stdin, or the server going away deactivates the client.
//! Logs go to `~/.ferret/logs/ferret-client.log` so stdout stays machine
//! readable.

mod settings;
mod watcher;

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use ferret_lsp::{
    Activation, EditorEvent, ExtensionContext, FileWatchService, LaunchProfile, NoopWatcher,
    SessionError, SessionEvent, SessionEvents, TransportKind, activate, deactivate,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use settings::Settings;
use watcher::PollingWatcher;

/// Session events flushed after deactivation.
const EVENT_DRAIN_BUDGET: usize = 64;

/// Conventional exit status for SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "ferret-client")]
#[command(about = "Ferret language client host - bridges editor events to ferret-lsp")]
#[command(version)]
struct Args {
    /// Extension installation directory; the server is resolved under it
    /// (defaults to the directory containing this binary)
    #[arg(long, env = "FERRET_EXTENSION_DIR")]
    extension_dir: Option<PathBuf>,

    /// Path to configuration file (defaults to ~/.ferret/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspace root (defaults to the current directory)
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Launch the server with its debug arguments
    #[arg(long)]
    debug: bool,

    /// Talk to the server over its stdin/stdout instead of TCP
    #[arg(long, conflicts_with = "attach")]
    stdio: bool,

    /// Attach to a server already listening on the configured port
    #[arg(long)]
    attach: bool,

    /// Override the configured TCP port
    #[arg(long)]
    port: Option<u16>,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries session events; stderr is the only safe fallback.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.ferret/logs/ferret-client.log
    if let Some(config_path) = Settings::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("ferret-client.log"));
    }

    // Fallback: ./.ferret/logs/ferret-client.log
    candidates.push(PathBuf::from(".ferret").join("logs").join("ferret-client.log"));

    candidates
}

fn apply_overrides(settings: &mut Settings, args: &Args) {
    if args.stdio {
        settings.client.transport = TransportKind::Stdio;
    }
    if args.attach {
        settings.client.attach = true;
    }
    if let Some(port) = args.port {
        settings.client.port = port;
    }
}

fn default_install_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("locating ferret-client binary")?;
    exe.parent()
        .map(PathBuf::from)
        .context("ferret-client binary has no parent directory")
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut settings = Settings::load(args.config.as_deref())?;
    apply_overrides(&mut settings, &args);

    let workspace = match &args.workspace {
        Some(path) => path.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("workspace {} not found", workspace.display()))?;
    let install_dir = match args.extension_dir.clone() {
        Some(dir) => dir,
        None => default_install_dir()?,
    };
    let context = ExtensionContext::new(install_dir).with_workspace_root(&workspace);
    let profile = if args.debug {
        LaunchProfile::Debug
    } else {
        LaunchProfile::Run
    };

    let (watcher, mut file_events) = if settings.watcher.enabled {
        let (watcher, rx) = PollingWatcher::new(workspace.clone(), settings.watcher.poll_interval());
        let watcher: Arc<dyn FileWatchService> = Arc::new(watcher);
        (watcher, Some(rx))
    } else {
        let watcher: Arc<dyn FileWatchService> = Arc::new(NoopWatcher);
        (watcher, None)
    };

    let (mut activation, mut events) = activate(&context, &settings.client, profile, watcher)?;
    let mut stdout = tokio::io::stdout();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = tokio::select! {
        result = activation.ready() => Some(result),
        _ = &mut ctrl_c => None,
    };
    let exit_code = match started {
        None => {
            tracing::info!("Interrupted during startup");
            Some(ExitCode::from(EXIT_INTERRUPTED))
        }
        Some(Err(err)) => Some(ExitCode::from(report_startup_failure(&err))),
        Some(Ok(())) => None,
    };
    if let Some(code) = exit_code {
        shut_down(activation, &mut events, &mut stdout).await?;
        return Ok(code);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, deactivating");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(event) = parse_event(&line)
                        && forward_or_interrupt(&activation, &event, &mut ctrl_c).await
                    {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::info!("Editor input closed, deactivating");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Reading editor input failed: {e}");
                    break;
                }
            },
            Some(event) = next_file_event(&mut file_events) => {
                if forward_or_interrupt(&activation, &event, &mut ctrl_c).await {
                    break;
                }
            }
            event = events.next() => {
                let Some(event) = event else { break };
                emit(&mut stdout, &event).await?;
                if let SessionEvent::ServerExited { reason } = event {
                    tracing::warn!(?reason, "Language server went away, deactivating");
                    break;
                }
            }
        }
    }

    shut_down(activation, &mut events, &mut stdout).await?;
    Ok(ExitCode::SUCCESS)
}

async fn shut_down(
    activation: Activation,
    events: &mut SessionEvents,
    stdout: &mut Stdout,
) -> Result<()> {
    if let Some(stop) = deactivate(Some(activation)) {
        let outcome = stop.await;
        tracing::info!(?outcome, "Language client deactivated");
    }
    for event in events.poll(EVENT_DRAIN_BUDGET) {
        emit(stdout, &event).await?;
    }
    Ok(())
}

async fn next_file_event(rx: &mut Option<mpsc::Receiver<EditorEvent>>) -> Option<EditorEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Exit status for a start that did not reach `Running`.
fn report_startup_failure(err: &SessionError) -> u8 {
    if err.is_fatal() {
        tracing::error!("Language client failed to start: {err}");
        eprintln!("Error: {err}");
        1
    } else {
        tracing::info!("Language client start abandoned: {err}");
        EXIT_INTERRUPTED
    }
}

fn parse_event(line: &str) -> Option<EditorEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line)
        .inspect_err(|e| tracing::warn!("Ignoring malformed editor event: {e}"))
        .ok()
}

/// Forward `event` unless Ctrl-C arrives first. Returns `true` when
/// interrupted; a server that stopped reading must not pin the loop.
async fn forward_or_interrupt<F>(
    activation: &Activation,
    event: &EditorEvent,
    ctrl_c: &mut Pin<&mut F>,
) -> bool
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        () = forward(activation, event) => false,
        _ = ctrl_c.as_mut() => {
            tracing::info!("Interrupted while forwarding, deactivating");
            true
        }
    }
}

async fn forward(activation: &Activation, event: &EditorEvent) {
    match activation.notify(event).await {
        Ok(forwarded) => tracing::debug!(?forwarded, "Editor event handled"),
        Err(e) => tracing::warn!("Editor event not forwarded: {e}"),
    }
}

async fn emit(stdout: &mut Stdout, event: &SessionEvent) -> Result<()> {
    let mut line = serde_json::to_string(event).context("serializing session event")?;
    line.push('\n');
    stdout
        .write_all(line.as_bytes())
        .await
        .context("writing session event")?;
    stdout.flush().await.context("flushing stdout")
}
