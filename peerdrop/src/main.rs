//! `PeerDrop` — peer-to-peer text and file transfer from the terminal.
//!
//! Connects to a signaling relay, negotiates a direct data channel with the
//! other member of a room, then sends every stdin line as a text message.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/peerdrop/config.toml`).
//!
//! ```bash
//! # First peer creates the offer
//! cargo run --bin peerdrop -- --relay-url ws://127.0.0.1:3000/ws --room r1 offer
//!
//! # Second peer answers it
//! cargo run --bin peerdrop -- --relay-url ws://127.0.0.1:3000/ws --room r1 listen
//! ```
//!
//! Commands: `/send <path>` sends a file, `/quit` disconnects, anything else
//! is sent as text.

use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use peerdrop::config::{CliArgs, ClientConfig};
use peerdrop::net::{self, SessionCommand, SessionEvent, SessionHandle};
use peerdrop::session::NegotiationState;
use peerdrop::transfer::TransferEvent;
use peerdrop::transfer::receive::save_received_file;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Hold the guard so buffered log lines are flushed on exit.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let net_config = match config.to_net_config(cli.mode.into()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    println!(
        "Connecting to {} (room {}, {})...",
        net_config.relay_url, net_config.room, net_config.role
    );
    let session = match net::connect(&net_config).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Some(reason) = run(session, &config.download_dir).await {
        eprintln!("Session closed: {reason}");
        std::process::exit(1);
    }
}

/// Initialize tracing to a file when `file_path` is given, otherwise to
/// stderr. A path without a usable file name also logs to stderr.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some((log_dir, file_name)) = file_path.and_then(split_log_path) else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        if let Some(path) = file_path {
            tracing::warn!(
                path = %path.display(),
                "log file path has no file name, logging to stderr"
            );
        }
        return None;
    };

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Split a log file path into its directory (default `.`) and file name.
fn split_log_path(path: &Path) -> Option<(&Path, &str)> {
    let file_name = path.file_name()?.to_str()?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Some((dir, file_name))
}

/// Drive the session from stdin until it closes. Returns the close reason
/// for a remote or transport close, `None` for a local quit.
async fn run(mut session: SessionHandle, download_dir: &Path) -> Option<String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut progress = ProgressPrinter::default();

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let command = match line {
                    Ok(Some(line)) => parse_input(&line),
                    Ok(None) | Err(_) => {
                        stdin_open = false;
                        Some(SessionCommand::Disconnect)
                    }
                };
                if let Some(command) = command {
                    if session.commands.send(command).await.is_err() {
                        break None;
                    }
                }
            }
            event = session.events.recv() => {
                let Some(event) = event else { break None };
                match event {
                    SessionEvent::StateChanged(NegotiationState::Connected) => {
                        println!("Connected. Type a message, /send <path>, or /quit.");
                    }
                    SessionEvent::StateChanged(state) => println!("[{state}]"),
                    SessionEvent::Transfer(event) => {
                        on_transfer_event(event, download_dir, &mut progress).await;
                    }
                    SessionEvent::CommandFailed { reason } => println!("! {reason}"),
                    SessionEvent::Closed { reason } => break reason,
                }
            }
        }
    }
}

async fn on_transfer_event(
    event: TransferEvent,
    download_dir: &Path,
    progress: &mut ProgressPrinter,
) {
    match event {
        TransferEvent::TextReceived { message } => println!("peer: {message}"),
        TransferEvent::SendStarted { name, size } => {
            progress.reset();
            println!("Sending {name} ({size} bytes)");
        }
        TransferEvent::SendProgress { name, fraction, .. } => {
            progress.print("sent", &name, fraction);
        }
        TransferEvent::SendComplete { name, size } => println!("Sent {name} ({size} bytes)"),
        TransferEvent::SendFailed { name, reason } => {
            println!("! Send of {} failed: {reason}", name.unwrap_or_default());
        }
        TransferEvent::ReceiveStarted { name, size } => {
            progress.reset();
            println!("Receiving {name} ({size} bytes)");
        }
        TransferEvent::ReceiveProgress { name, fraction, .. } => {
            progress.print("received", &name, fraction);
        }
        TransferEvent::ReceiveComplete(file) => {
            if file.truncated {
                println!(
                    "! {} arrived with {} of {} bytes",
                    file.name,
                    file.data.len(),
                    file.declared_size
                );
            }
            match save_received_file(download_dir, &file).await {
                Ok(path) => println!("Saved {}", path.display()),
                Err(e) => println!("! Could not save {}: {e}", file.name),
            }
        }
        TransferEvent::ReceiveDiscarded { name, received } => {
            println!("! Dropped partial {name} after {received} bytes");
        }
    }
}

/// Map one input line to a command. Blank lines are ignored.
fn parse_input(line: &str) -> Option<SessionCommand> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == "/quit" {
        return Some(SessionCommand::Disconnect);
    }
    if let Some(path) = trimmed.strip_prefix("/send ") {
        let path = path.trim();
        if !path.is_empty() {
            return Some(SessionCommand::SendFile(PathBuf::from(path)));
        }
    }
    Some(SessionCommand::SendText(line.to_string()))
}

/// Prints progress in 10% steps.
#[derive(Debug, Default)]
struct ProgressPrinter {
    last_step: Option<u8>,
}

impl ProgressPrinter {
    fn reset(&mut self) {
        self.last_step = None;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn print(&mut self, verb: &str, name: &str, fraction: f64) {
        let percent = (fraction.clamp(0.0, 1.0) * 100.0).floor() as u8;
        let step = percent / 10;
        if self.last_step != Some(step) {
            self.last_step = Some(step);
            println!("  {name}: {percent}% {verb}");
        }
    }
}
