//! TCP listener and the running-server handle.
//!
//! [`RelayServer::start`] binds the listening socket, spawns the accept loop
//! and returns a handle.  The handle is how the operator (the console in
//! `main.rs`, or a test) talks to the running relay: list members, kick,
//! toggle admission, follow events and finally shut everything down.
//!
//! # Shutdown order
//!
//! 1. The relay stops: every member is removed and told `ServerShutdown`.
//! 2. The accept loop is signalled, stops accepting and drops the listener,
//!    so new connection attempts are refused.
//! 3. Session tasks get a grace period to flush their `Disconnect` frames;
//!    stragglers are aborted.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use relay_core::Identity;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::application::registry::MemberInfo;
use crate::application::relay::{RelayError, RelayEvent, RelayOptions, RelayService};
use crate::infrastructure::network::connection::{run_session, SessionLimits, SharedRelay};
use crate::infrastructure::storage::config::{AppConfig, ConfigError};

/// How long session tasks get to finish after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Errors from starting or running the network layer.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("could not bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything [`RelayServer::start`] needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    pub bind_address: SocketAddr,
    pub options: RelayOptions,
    pub limits: SessionLimits,
}

impl ServerSettings {
    /// Builds settings from a loaded configuration file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidBindAddress`] if the address does not parse.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: config.socket_addr()?,
            options: RelayOptions {
                accept_new_clients: config.server.accept_new_clients,
                echo_to_sender: config.server.echo_to_sender,
            },
            limits: SessionLimits::from(&config.limits),
        })
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        let config = AppConfig::default();
        Self {
            bind_address: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                config.server.port,
            ),
            options: RelayOptions::default(),
            limits: SessionLimits::from(&config.limits),
        }
    }
}

/// Handle to a running relay.
pub struct RelayServer {
    local_addr: SocketAddr,
    relay: SharedRelay,
    events: broadcast::Sender<RelayEvent>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl RelayServer {
    /// Binds the listener and starts accepting connections.
    ///
    /// # Errors
    ///
    /// [`NetworkError::BindFailed`] if the address is in use or not ours.
    pub async fn start(settings: ServerSettings) -> Result<Self, NetworkError> {
        let addr = settings.bind_address;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::BindFailed { addr, source })?;
        let local_addr = listener.local_addr()?;

        let service = RelayService::new(settings.options);
        let events = service.event_sender();
        let relay: SharedRelay = Arc::new(Mutex::new(service));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&relay),
            settings.limits,
            shutdown_rx,
        ));
        info!(%local_addr, "relay listening");

        Ok(Self {
            local_addr,
            relay,
            events,
            shutdown,
            accept_task,
        })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub async fn members(&self) -> Vec<MemberInfo> {
        self.relay.lock().await.members()
    }

    /// Removes the named member and sends it `Disconnect(Kicked)`.
    pub async fn kick(&self, name: &str) -> Result<Identity, RelayError> {
        self.relay.lock().await.kick(name)
    }

    pub async fn set_accepting_new_clients(&self, accepting: bool) -> Result<(), RelayError> {
        self.relay.lock().await.set_accepting_new_clients(accepting)
    }

    pub async fn is_accepting_new_clients(&self) -> bool {
        self.relay.lock().await.is_accepting_new_clients()
    }

    /// Stops the relay.  Returns once the listener is closed and every
    /// session task has finished or been aborted.
    pub async fn shutdown(self) {
        let closed = self.relay.lock().await.shutdown();
        info!(members = closed, "relay stopping");
        // Err only if the accept loop already ended.
        let _ = self.shutdown.send(true);
        if let Err(e) = self.accept_task.await {
            warn!(error = %e, "accept loop ended abnormally");
        }
        info!("relay stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    relay: SharedRelay,
    limits: SessionLimits,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            // Only `true` is ever sent; a dropped handle also stops the loop.
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "could not set TCP_NODELAY");
                    }
                    let span = info_span!("session", %peer, member = tracing::field::Empty);
                    sessions.spawn(
                        run_session(stream, peer, Arc::clone(&relay), limits, shutdown.clone())
                            .instrument(span),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    // Usually fd exhaustion; back off instead of spinning.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            // Reap finished sessions so the set does not grow without bound.
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    warn!(error = %e, "session task failed");
                }
            }
        }
    }

    drop(listener);
    debug!(sessions = sessions.len(), "listener closed; draining sessions");

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                warn!(error = %e, "session task failed");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(remaining = sessions.len(), "sessions did not finish in time; aborting");
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
}
