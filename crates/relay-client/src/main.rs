//! Terminal client for the classroom relay.
//!
//! # Usage
//!
//! ```text
//! relay-client --name <NAME> [--server <HOST:PORT>] [--role <ROLE>]
//! ```
//!
//! Type a line to send it to everyone.  Commands:
//!
//! ```text
//! /to bob,carol text   send to specific members
//! /users               who is online
//! /history [name]      received packages (optionally only from name)
//! /forget <name>       drop stored packages from name
//! /quit                leave
//! ```

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use relay_client::application::command::{ClientCommand, CommandError};
use relay_client::application::package_store::{PackageStore, ReceivedPackage};
use relay_client::infrastructure::network::{ClientConfig, ClientEvent, RelayClient};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Classroom relay terminal client.
#[derive(Debug, Parser)]
#[command(
    name = "relay-client",
    about = "Terminal client for the classroom relay",
    version
)]
struct Cli {
    /// Relay server address (host:port).
    #[arg(long, default_value = "127.0.0.1:40000", env = "RELAY_SERVER")]
    server: String,

    /// Name to join under.
    #[arg(long, env = "RELAY_NAME")]
    name: String,

    /// Role to join with.
    #[arg(long, default_value = "user", env = "RELAY_ROLE")]
    role: String,
}

fn print_package(package: &ReceivedPackage) {
    match package.text() {
        Some(text) => println!("[{}] {}", package.sender, text),
        None => println!(
            "[{}] <{} bytes of {}>",
            package.sender,
            package.payload.len(),
            package.content_type
        ),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr at `warn` unless `RUST_LOG` says otherwise, so they
    // do not interleave with the chat.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let server_addr = tokio::net::lookup_host(&cli.server)
        .await
        .with_context(|| format!("resolving '{}'", cli.server))?
        .next()
        .with_context(|| format!("'{}' did not resolve to an address", cli.server))?;

    let config = ClientConfig::new(server_addr, cli.name).with_role(cli.role);
    let (client, mut events) = RelayClient::connect(config)
        .await
        .context("joining the relay")?;
    println!(
        "joined {} as {}; type /quit to leave",
        client.server_addr(),
        client.name()
    );

    let mut store = PackageStore::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::PackageReceived(package)) => {
                    print_package(&package);
                    store.push(package);
                }
                Some(ClientEvent::UsersChanged(users)) => {
                    let names: Vec<&str> = users.iter().map(|u| u.name.as_str()).collect();
                    println!("* online: {}", names.join(", "));
                }
                Some(ClientEvent::ServerError(error)) => {
                    println!("! server: {}", error.description);
                }
                Some(ClientEvent::ConnectionBroken(cause)) => {
                    println!("* disconnected: {cause}");
                    break;
                }
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    client.disconnect().await?;
                    break;
                };
                match ClientCommand::parse(&line) {
                    Ok(ClientCommand::Send { recipients, text }) => {
                        if let Err(e) = client.send_text(recipients, &text).await {
                            println!("! {e}");
                        }
                    }
                    Ok(ClientCommand::Users) => {
                        for user in client.users() {
                            println!("  {:<24} {}", user.name, user.role);
                        }
                    }
                    Ok(ClientCommand::History { sender: None }) => {
                        store.iter().for_each(print_package);
                    }
                    Ok(ClientCommand::History { sender: Some(sender) }) => {
                        store.from_sender(&sender).for_each(print_package);
                    }
                    Ok(ClientCommand::Forget { sender }) => {
                        let removed = store.remove_where(|p| p.is_from(&sender));
                        println!("* forgot {removed} package(s) from {sender}");
                    }
                    Ok(ClientCommand::Quit) => {
                        if let Err(e) = client.disconnect().await {
                            warn!("could not say goodbye: {e}");
                        }
                        break;
                    }
                    Err(CommandError::Empty) => {}
                    Err(e) => println!("! {e}"),
                }
            }
        }
    }

    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        // Arrange: only the required name is given
        let cli = Cli::parse_from(["relay-client", "--name", "alice"]);

        // Assert
        assert_eq!(cli.server, "127.0.0.1:40000");
        assert_eq!(cli.role, "user");
    }

    #[test]
    fn test_cli_requires_a_name() {
        assert!(Cli::try_parse_from(["relay-client"]).is_err()
            || std::env::var("RELAY_NAME").is_ok());
    }
}
