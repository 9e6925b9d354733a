//! Classroom relay server entry point.
//!
//! Loads the configuration, applies command-line overrides, starts the
//! relay and then runs a small operator console on stdin until `stop` or
//! Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! relay-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>         Config file [default: platform config dir]
//!   --bind <IP>             Address to listen on
//!   --port <PORT>           TCP port to listen on
//!   --reject-new-clients    Start with admission switched off
//!   --echo-to-sender        Deliver a sender's packages back to it
//!   --print-config          Print the effective configuration and exit
//! ```
//!
//! Every option can also come from a `RELAY_*` environment variable; the
//! command line wins when both are present, and both win over the file.
//!
//! # Operator console
//!
//! ```text
//! list              show active members
//! kick <name>       remove a member
//! accept on|off     toggle admission of new clients
//! stop              shut the relay down
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_server::application::relay::RelayEvent;
use relay_server::infrastructure::network::{RelayServer, ServerSettings};
use relay_server::infrastructure::storage::config::{load_config, load_config_from, AppConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Classroom relay server.
///
/// Accepts clients over TCP, admits them under unique names and forwards
/// their packages to the members they address.
#[derive(Debug, Parser)]
#[command(
    name = "relay-server",
    about = "Relay server for classroom messaging",
    version
)]
struct Cli {
    /// Path of the TOML configuration file.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// IP address to listen on (overrides the file).
    #[arg(long, env = "RELAY_BIND")]
    bind: Option<String>,

    /// TCP port to listen on (overrides the file).
    #[arg(long, env = "RELAY_PORT")]
    port: Option<u16>,

    /// Start with admission of new clients switched off.
    #[arg(long, env = "RELAY_REJECT_NEW_CLIENTS")]
    reject_new_clients: bool,

    /// Deliver a sender's own packages back to it.
    #[arg(long, env = "RELAY_ECHO_TO_SENDER")]
    echo_to_sender: bool,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Loads the configuration file and applies the overrides on top.
    fn into_config(self) -> anyhow::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => load_config_from(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => load_config().context("loading config")?,
        };
        if let Some(bind) = self.bind {
            config.server.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.reject_new_clients {
            config.server.accept_new_clients = false;
        }
        if self.echo_to_sender {
            config.server.echo_to_sender = true;
        }
        Ok(config)
    }
}

// ── Operator console ──────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    List,
    Kick(String),
    Accept(bool),
    Stop,
}

impl ConsoleCommand {
    fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default();
        let argument = words.next();
        match (command, argument) {
            ("list", None) => Ok(Self::List),
            ("kick", Some(name)) => Ok(Self::Kick(name.to_string())),
            ("accept", Some("on")) => Ok(Self::Accept(true)),
            ("accept", Some("off")) => Ok(Self::Accept(false)),
            ("stop" | "quit", None) => Ok(Self::Stop),
            _ => Err(format!(
                "unknown command '{}'; try list, kick <name>, accept on|off, stop",
                line.trim()
            )),
        }
    }
}

/// Runs one console command.  Returns `false` when the relay should stop.
async fn execute(server: &RelayServer, command: ConsoleCommand) -> bool {
    match command {
        ConsoleCommand::List => {
            let members = server.members().await;
            println!("{} member(s)", members.len());
            for member in members {
                let online = member.joined_at.elapsed().unwrap_or_default().as_secs();
                println!("  {:<24} {:<8} online {online}s", member.name, member.role);
            }
        }
        ConsoleCommand::Kick(name) => match server.kick(&name).await {
            Ok(identity) => println!("kicked {identity}"),
            Err(e) => println!("{e}"),
        },
        ConsoleCommand::Accept(accepting) => {
            match server.set_accepting_new_clients(accepting).await {
                Ok(()) => println!(
                    "new clients are {}",
                    if accepting { "accepted" } else { "rejected" }
                ),
                Err(e) => println!("{e}"),
            }
        }
        ConsoleCommand::Stop => return false,
    }
    true
}

async fn log_events(mut events: broadcast::Receiver<RelayEvent>) {
    loop {
        match events.recv().await {
            Ok(RelayEvent::ClientJoined { identity, peer, .. }) => {
                info!(%peer, "{identity} joined");
            }
            Ok(RelayEvent::ClientLeft { identity, cause, .. }) => {
                info!(%cause, "{identity} left");
            }
            Ok(RelayEvent::ClientRejected { peer, name, reason }) => {
                info!(%peer, %reason, "rejected join as '{name}'");
            }
            Ok(RelayEvent::PackageRelayed {
                sender,
                content_type,
                recipients,
            }) => {
                tracing::debug!(%content_type, recipients, "package from {sender}");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let print_config = cli.print_config;
    let config = cli.into_config()?;

    if print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    // `RUST_LOG` wins; otherwise the level from the config file.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    let settings = ServerSettings::from_config(&config)?;
    let server = RelayServer::start(settings)
        .await
        .context("starting relay server")?;
    info!(
        "classroom relay listening on {} (new clients {})",
        server.local_addr(),
        if settings.options.accept_new_clients { "accepted" } else { "rejected" }
    );

    tokio::spawn(log_events(server.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("failed to listen for Ctrl+C: {e}");
                }
                info!("received Ctrl+C; shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match ConsoleCommand::parse(&line) {
                    Ok(command) => {
                        if !execute(&server, command).await {
                            break;
                        }
                    }
                    Err(message) => println!("{message}"),
                },
                // stdin closed (e.g. running as a service): wait for Ctrl+C only.
                Ok(None) => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("failed to listen for Ctrl+C: {e}");
                    }
                    break;
                }
                Err(e) => {
                    warn!("console read failed: {e}");
                    break;
                }
            },
        }
    }

    server.shutdown().await;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
