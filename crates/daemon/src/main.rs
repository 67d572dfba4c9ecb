//! agentdeck broker daemon
//!
//! Headless service that runs agent CLIs in PTYs and shares them with
//! browser clients over WebSocket.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{ControlPaths, DaemonStatus, IpcClient};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::protocol::SessionSummary;
use daemon::session::state::now_millis;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Timeout for connecting to the daemon's IPC socket.
const IPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// agentdeck daemon - shares agent CLI sessions with the browser.
#[derive(Parser, Debug)]
#[command(name = "agentdeck-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the broker in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Delete a session, stopping its agent and notifying its viewers
    Delete {
        /// Session ID to delete
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate().context("Invalid configuration")?;

    let log_to_file = matches!(cli.command, Commands::Start) && config.daemon.log_to_file;
    let _log_guard = init_logging(cli.verbose, &config, log_to_file);

    if let Some(config_path) = &cli.config {
        tracing::debug!(path = %config_path.display(), "Using config file");
    }

    let control_paths = ControlPaths::resolve();

    match cli.command {
        Commands::Start => {
            // Check for existing daemon BEFORE starting
            if let Some(pid) = control_paths.running_pid() {
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  agentdeck-daemon stop");
                eprintln!();
                eprintln!("To check daemon status, run:");
                eprintln!("  agentdeck-daemon status");
                std::process::exit(1);
            }

            tracing::info!(version = env!("CARGO_PKG_VERSION"), "agentdeck daemon starting");
            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_headless(&mut orchestrator).await?;
        }
        Commands::Stop { force, timeout } => {
            tracing::debug!(force, timeout, "Stopping daemon");

            if force {
                match force_stop_daemon(&control_paths) {
                    Ok(()) => {
                        println!("Daemon forcefully terminated");
                        std::process::exit(0);
                    }
                    Err(e) => {
                        eprintln!("Failed to stop daemon: {}", e);
                        std::process::exit(1);
                    }
                }
            } else {
                match graceful_stop_daemon(&control_paths, timeout).await {
                    Ok(()) => {
                        println!("Daemon stopped successfully");
                        std::process::exit(0);
                    }
                    Err(e) => {
                        eprintln!("Failed to stop daemon: {}", e);
                        eprintln!("Try: agentdeck-daemon stop --force");
                        std::process::exit(1);
                    }
                }
            }
        }
        Commands::Status => match query_daemon_status(&control_paths).await {
            Ok(status) => {
                print_status(&status);
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("Daemon is not running: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sessions(cmd) => match cmd {
            SessionsCommands::List { json } => match query_sessions_list(&control_paths).await {
                Ok(sessions) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions);
                    }
                    std::process::exit(0);
                }
                Err(e) => {
                    eprintln!("Failed to list sessions: {}", e);
                    std::process::exit(1);
                }
            },
            SessionsCommands::Delete { session_id } => {
                match delete_session(&control_paths, &session_id).await {
                    Ok(disconnected) => {
                        println!(
                            "Session {} deleted ({} connection(s) notified)",
                            session_id, disconnected
                        );
                        std::process::exit(0);
                    }
                    Err(e) => {
                        eprintln!("Failed to delete session {}: {}", session_id, e);
                        std::process::exit(1);
                    }
                }
            }
        },
    }

    Ok(())
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over both `--verbose` and `daemon.log_level`. The returned
/// guard must live until exit so buffered file output is flushed.
fn init_logging(verbose: bool, config: &Config, log_to_file: bool) -> Option<WorkerGuard> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = fmt::layer().with_target(false).boxed();

    let (file_layer, guard) = if log_to_file {
        let log_dir = config.log_dir();
        match std::fs::create_dir_all(&log_dir) {
            Ok(()) => {
                let appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "agentdeck.log");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .boxed();
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!(
                    "Warning: Failed to create log directory {}: {}",
                    log_dir.display(),
                    e
                );
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

async fn connect_to_daemon(paths: &ControlPaths) -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(&paths.socket, IPC_CONNECT_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Query the daemon status via IPC.
async fn query_daemon_status(paths: &ControlPaths) -> anyhow::Result<DaemonStatus> {
    let mut client = connect_to_daemon(paths).await?;
    client.status().await.context("Failed to query status")
}

/// Query the list of sessions from the daemon.
async fn query_sessions_list(paths: &ControlPaths) -> anyhow::Result<Vec<SessionSummary>> {
    let mut client = connect_to_daemon(paths).await?;
    client
        .list_sessions()
        .await
        .context("Failed to query sessions")
}

/// Delete a session by ID via IPC. Returns how many connections were bound
/// to it.
async fn delete_session(paths: &ControlPaths, session_id: &str) -> anyhow::Result<usize> {
    let mut client = connect_to_daemon(paths).await?;
    Ok(client.delete_session(session_id).await?)
}

fn print_status(status: &DaemonStatus) {
    println!("Daemon Status: running");
    println!("  Listening:   ws://{}", status.bind_addr);
    println!("  Uptime:      {}", format_duration(status.uptime_secs));
    println!("  Sessions:    {}", status.sessions);
    println!("  Agents:      {}", status.active_agents);
    println!("  Connections: {}", status.connections);
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.id.len())
        .max()
        .unwrap_or(8)
        .max(8);
    let name_width = sessions
        .iter()
        .map(|s| s.name.chars().count())
        .max()
        .unwrap_or(4)
        .clamp(4, 24);

    println!(
        "{:<id_width$}  {:<name_width$}  {:<7}  {:>5}  {:>10}  DIRECTORY",
        "ID",
        "NAME",
        "AGENT",
        "CONNS",
        "ACTIVITY",
        id_width = id_width,
        name_width = name_width
    );
    println!("{}", "-".repeat(id_width + name_width + 44));

    for session in sessions {
        let agent = match (session.active, session.agent_kind) {
            (true, Some(kind)) => kind.to_string(),
            _ => "-".to_string(),
        };

        println!(
            "{:<id_width$}  {:<name_width$}  {:<7}  {:>5}  {:>10}  {}",
            session.id,
            truncate_str(&session.name, name_width),
            agent,
            session.connections,
            format_relative_time(session.last_activity),
            session.working_dir,
            id_width = id_width,
            name_width = name_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp in milliseconds as relative time (e.g., "5m ago").
fn format_relative_time(timestamp_ms: u64) -> String {
    let elapsed = now_millis().saturating_sub(timestamp_ms) / 1000;

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum number of characters, adding "..." if
/// truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Gracefully stop the daemon via IPC.
///
/// Sends a shutdown request to the daemon and waits for it to exit.
async fn graceful_stop_daemon(paths: &ControlPaths, timeout_secs: u64) -> anyhow::Result<()> {
    let mut client = connect_to_daemon(paths).await?;

    println!("Sending shutdown request...");

    client.set_timeout(Duration::from_secs(timeout_secs));
    client
        .stop()
        .await
        .context("Failed to send stop request")?;
    println!("Shutdown acknowledged, waiting for daemon to exit...");

    // Wait for daemon to actually exit by polling the socket
    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !paths.socket.exists() {
            return Ok(());
        }

        if IpcClient::connect_with_timeout(&paths.socket, Duration::from_millis(100))
            .await
            .is_err()
        {
            let _ = std::fs::remove_file(&paths.pid_file);
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    Err(anyhow::anyhow!(
        "Timeout waiting for daemon to exit ({}s)",
        timeout_secs
    ))
}

/// Force stop the daemon using SIGKILL.
///
/// Reads the daemon PID from the PID file and sends SIGKILL. Agent processes
/// are not reaped; their PTYs close when the daemon dies.
fn force_stop_daemon(paths: &ControlPaths) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = paths
        .running_pid()
        .context("No live daemon PID file - is the daemon running?")?;
    let raw = i32::try_from(pid).context("PID out of range")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {})", pid))?;

    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(&paths.pid_file);
    let _ = std::fs::remove_file(&paths.socket);

    Ok(())
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Run the daemon until a signal or an IPC stop request arrives.
async fn run_headless(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    if let Some(addr) = orchestrator.local_addr() {
        println!("agentdeck listening on ws://{}", addr);
    }

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!(state = ?state, "Orchestrator state changed");
                }
                OrchestratorEvent::Listening { addr } => {
                    tracing::debug!(addr = %addr, "Listening");
                }
                OrchestratorEvent::StopRequested => {
                    tracing::debug!("Stop requested");
                }
            }
        }
    });

    let stop_requested = orchestrator.stop_requested();
    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = stop_requested.cancelled() => {
            tracing::info!("Received stop request");
        }
    }

    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
