//! Network infrastructure for the client: the [`RelayClient`].
//!
//! Architecture:
//! - [`RelayClient::connect`] opens the TCP stream and performs the join
//!   handshake before returning, so a returned client is always `Active`.
//! - A background reader task decodes inbound frames, answers `Ping` with
//!   `Pong`, and forwards everything the application cares about as
//!   [`ClientEvent`]s on an `mpsc` channel.
//! - Outbound frames go through one write half behind a `tokio::sync::Mutex`
//!   shared by the caller and the reader task.
//!
//! # Why a distinct `ConnectionBroken`? (for beginners)
//!
//! A dropped TCP connection and a kick look the same at the socket level:
//! the stream ends.  The server therefore sends a `Disconnect` frame with a
//! reason first, and the client turns that reason into a [`BrokenCause`].
//! The terminal (or any other front end) can then tell the user "you were
//! removed by the teacher" instead of "I/O error".

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relay_core::domain::package::DEFAULT_CONTENT_TYPE;
use relay_core::protocol::messages::{
    DisconnectReason, ErrorMessage, JoinMessage, JoinResponseMessage, PackageMessage, UserEntry,
};
use relay_core::protocol::{write_message, FrameReader, SequenceCounter, StreamError};
use relay_core::{Recipients, RejectReason, RelayMessage, CURRENT_VERSION};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::application::package_store::ReceivedPackage;

/// How long the server gets to answer a join request.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why an established connection ended without the user asking for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokenCause {
    /// The operator removed this client.
    Kicked,
    /// The server is shutting down.
    ServerShutdown,
    /// The server closed the stream without saying why.
    ServerClosed,
    /// The server considered this client unresponsive.
    Unresponsive,
    /// The server rejected something this client sent.
    ProtocolViolation,
    /// The transport failed.
    Transport(String),
}

impl From<DisconnectReason> for BrokenCause {
    fn from(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::Kicked => BrokenCause::Kicked,
            DisconnectReason::ServerShutdown => BrokenCause::ServerShutdown,
            DisconnectReason::Unresponsive => BrokenCause::Unresponsive,
            DisconnectReason::ProtocolViolation => BrokenCause::ProtocolViolation,
            DisconnectReason::ClientLeaving => BrokenCause::ServerClosed,
        }
    }
}

impl fmt::Display for BrokenCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokenCause::Kicked => f.write_str("you were removed by the operator"),
            BrokenCause::ServerShutdown => f.write_str("the server is shutting down"),
            BrokenCause::ServerClosed => f.write_str("the server closed the connection"),
            BrokenCause::Unresponsive => f.write_str("the server dropped this client as unresponsive"),
            BrokenCause::ProtocolViolation => f.write_str("the server rejected a message from this client"),
            BrokenCause::Transport(detail) => write!(f, "connection lost: {detail}"),
        }
    }
}

/// Errors returned by [`RelayClient`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to relay at {addr}: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// The server refused the join request.
    #[error("join rejected: {0}")]
    Rejected(RejectReason),
    #[error("the server did not answer the join request in time")]
    HandshakeTimeout,
    #[error("unexpected response to join: {0}")]
    UnexpectedResponse(String),
    /// The client has left or lost its connection.
    #[error("not connected")]
    NotConnected,
    #[error("{0}")]
    ConnectionBroken(BrokenCause),
    #[error("protocol error: {0}")]
    Protocol(#[from] StreamError),
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Configuration, status and events ──────────────────────────────────────────

/// What [`RelayClient::connect`] needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub name: String,
    pub role: String,
    pub handshake_timeout: Duration,
}

impl ClientConfig {
    /// A config for a standard user.
    pub fn new(server_addr: SocketAddr, name: impl Into<String>) -> Self {
        Self {
            server_addr,
            name: name.into(),
            role: relay_core::Role::User.as_str().to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }
}

/// Connection state as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Joined; packages can be sent.
    Active,
    /// The caller disconnected.
    Left,
    /// The connection ended from the other side.
    Broken(BrokenCause),
}

impl ConnectionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionStatus::Active)
    }
}

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    PackageReceived(ReceivedPackage),
    /// The server pushed a new roster.
    UsersChanged(Vec<UserEntry>),
    /// The server reported an error about something this client sent.
    ServerError(ErrorMessage),
    /// The connection ended; this is always the last event.
    ConnectionBroken(BrokenCause),
}

// ── RelayClient ───────────────────────────────────────────────────────────────

struct FrameWriter {
    half: OwnedWriteHalf,
    sequence: SequenceCounter,
}

impl FrameWriter {
    async fn send(&mut self, message: &RelayMessage) -> Result<(), StreamError> {
        write_message(&mut self.half, message, &self.sequence).await
    }
}

/// A joined connection to a relay server.
pub struct RelayClient {
    name: String,
    server_addr: SocketAddr,
    writer: Arc<Mutex<FrameWriter>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    users: Arc<watch::Sender<Vec<UserEntry>>>,
    events: mpsc::Sender<ClientEvent>,
    reader_task: JoinHandle<()>,
}

impl RelayClient {
    /// Connects and joins.  On success the client is `Active` and the
    /// receiver yields [`ClientEvent`]s until the connection ends.
    ///
    /// # Errors
    ///
    /// - [`ClientError::ConnectFailed`] if the TCP connection fails.
    /// - [`ClientError::Rejected`] with the server's reason.
    /// - [`ClientError::HandshakeTimeout`] if the server does not answer.
    /// - [`ClientError::UnexpectedResponse`] / [`ClientError::Protocol`] if
    ///   the server answers with something other than a join response.
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), ClientError> {
        let addr = config.server_addr;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::ConnectFailed { addr, source })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY: {e}");
        }

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let sequence = SequenceCounter::new();
        join_relay(&mut reader, &mut write_half, &sequence, &config).await?;
        info!(server = %addr, name = %config.name, "joined relay");

        let writer = Arc::new(Mutex::new(FrameWriter {
            half: write_half,
            sequence,
        }));
        let status = Arc::new(watch::channel(ConnectionStatus::Active).0);
        let users = Arc::new(watch::channel(Vec::new()).0);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let reader_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&writer),
            Arc::clone(&status),
            Arc::clone(&users),
            events_tx.clone(),
        ));

        Ok((
            Self {
                name: config.name,
                server_addr: addr,
                writer,
                status,
                users,
                events: events_tx,
                reader_task,
            },
            events_rx,
        ))
    }

    /// The name this client joined under.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_active()
    }

    /// The most recent roster pushed by the server.
    pub fn users(&self) -> Vec<UserEntry> {
        self.users.borrow().clone()
    }

    /// Sends UTF-8 text as a `text/plain` package.
    ///
    /// # Errors
    ///
    /// Same as [`RelayClient::send_package`].
    pub async fn send_text(&self, recipients: Recipients, text: &str) -> Result<(), ClientError> {
        self.send_package(recipients, DEFAULT_CONTENT_TYPE, text.as_bytes().to_vec())
            .await
    }

    /// Sends a package.  The server stamps the sender; whether anyone is
    /// actually addressed is only known to the server.
    ///
    /// # Errors
    ///
    /// - [`ClientError::NotConnected`] unless `Active`.
    /// - [`ClientError::Protocol`] if the package cannot be encoded, for
    ///   example because it exceeds the frame limit.  Nothing is sent and the
    ///   connection stays up.
    /// - [`ClientError::Protocol`] or [`ClientError::Io`] if the write fails.
    ///   The connection is then broken and `ConnectionBroken` is emitted.
    pub async fn send_package(
        &self,
        recipients: Recipients,
        content_type: &str,
        payload: Vec<u8>,
    ) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let message = RelayMessage::Package(PackageMessage {
            sender: self.name.clone(),
            recipients,
            content_type: content_type.to_string(),
            payload,
        });

        let result = self.writer.lock().await.send(&message).await;
        match result {
            Ok(()) => Ok(()),
            Err(StreamError::Protocol(e)) => Err(StreamError::Protocol(e).into()),
            Err(e) => {
                let cause = BrokenCause::Transport(e.to_string());
                if end_connection(&self.status, ConnectionStatus::Broken(cause.clone())) {
                    warn!(%cause, "send failed; connection to relay ended");
                    deliver(&self.events, ClientEvent::ConnectionBroken(cause)).await;
                }
                Err(e.into())
            }
        }
    }

    /// Leaves the relay.  Idempotent; a no-op once the connection has ended.
    ///
    /// # Errors
    ///
    /// [`ClientError::Protocol`] or [`ClientError::Io`] if the goodbye
    /// could not be written.  The client is `Left` either way.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        if !end_connection(&self.status, ConnectionStatus::Left) {
            return Ok(());
        }
        info!("leaving relay");
        let mut writer = self.writer.lock().await;
        writer
            .send(&RelayMessage::Disconnect {
                reason: DisconnectReason::ClientLeaving,
            })
            .await?;
        writer.half.shutdown().await?;
        Ok(())
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

// ── Internals ─────────────────────────────────────────────────────────────────

/// Moves `Active` to `next`.  Returns `false` if the connection had already
/// ended, so only the first ending is reported.
fn end_connection(status: &watch::Sender<ConnectionStatus>, next: ConnectionStatus) -> bool {
    status.send_if_modified(|current| {
        if current.is_active() {
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Sends the join request and waits for the answer.
async fn join_relay<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    sequence: &SequenceCounter,
    config: &ClientConfig,
) -> Result<(), ClientError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = RelayMessage::Join(JoinMessage {
        version: CURRENT_VERSION,
        name: config.name.clone(),
        role: config.role.clone(),
    });
    write_message(writer, &request, sequence).await?;

    let response = timeout(config.handshake_timeout, reader.read_message())
        .await
        .map_err(|_| ClientError::HandshakeTimeout)??;
    match response {
        Some(RelayMessage::JoinResponse(JoinResponseMessage {
            rejection: None, ..
        })) => Ok(()),
        Some(RelayMessage::JoinResponse(JoinResponseMessage {
            rejection: Some(reason),
            ..
        })) => Err(ClientError::Rejected(reason)),
        Some(RelayMessage::Error(error)) => Err(ClientError::UnexpectedResponse(format!(
            "server reported {:?}: {}",
            error.error_code, error.description
        ))),
        Some(other) => Err(ClientError::UnexpectedResponse(format!(
            "expected JoinResponse, got {:?}",
            other.message_type()
        ))),
        None => Err(ClientError::ConnectionBroken(BrokenCause::ServerClosed)),
    }
}

async fn deliver(events: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    if events.send(event).await.is_err() {
        debug!("event receiver dropped");
    }
}

async fn read_loop(
    mut reader: FrameReader<OwnedReadHalf>,
    writer: Arc<Mutex<FrameWriter>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    users: Arc<watch::Sender<Vec<UserEntry>>>,
    events: mpsc::Sender<ClientEvent>,
) {
    let cause = loop {
        let (header, message) = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break BrokenCause::ServerClosed,
            Err(e) => break BrokenCause::Transport(e.to_string()),
        };
        // Ended locally (disconnect or a failed send); nothing more to report.
        if !status.borrow().is_active() {
            return;
        }
        match message {
            RelayMessage::Package(package) => {
                let received = ReceivedPackage::from_wire(package, header.timestamp_us);
                deliver(&events, ClientEvent::PackageReceived(received)).await;
            }
            RelayMessage::UserList(list) => {
                users.send_replace(list.clone());
                deliver(&events, ClientEvent::UsersChanged(list)).await;
            }
            RelayMessage::Ping(token) => {
                if let Err(e) = writer.lock().await.send(&RelayMessage::Pong(token)).await {
                    break BrokenCause::Transport(e.to_string());
                }
            }
            RelayMessage::Pong(_) => {}
            RelayMessage::Error(error) => {
                warn!(code = ?error.error_code, "server reported: {}", error.description);
                deliver(&events, ClientEvent::ServerError(error)).await;
            }
            RelayMessage::Disconnect { reason } => break BrokenCause::from(reason),
            other => warn!(msg_type = ?other.message_type(), "ignoring unexpected frame"),
        }
    };

    if end_connection(&status, ConnectionStatus::Broken(cause.clone())) {
        info!(%cause, "connection to relay ended");
        deliver(&events, ClientEvent::ConnectionBroken(cause)).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::decode_message;
    use relay_core::protocol::encode_message_now;

    fn config() -> ClientConfig {
        ClientConfig::new("127.0.0.1:40000".parse().unwrap(), "alice")
    }

    fn frame(message: &RelayMessage) -> Vec<u8> {
        encode_message_now(message, 0).unwrap()
    }

    #[tokio::test]
    async fn test_join_sends_request_and_accepts_response() {
        // Arrange
        let response = frame(&RelayMessage::JoinResponse(JoinResponseMessage::accepted(
            CURRENT_VERSION,
        )));
        let mut reader = FrameReader::new(tokio_test::io::Builder::new().read(&response).build());
        let mut written: Vec<u8> = Vec::new();

        // Act
        let result = join_relay(&mut reader, &mut written, &SequenceCounter::new(), &config()).await;

        // Assert
        assert!(result.is_ok());
        let (sent, _) = decode_message(&written).unwrap();
        assert_eq!(
            sent,
            RelayMessage::Join(JoinMessage {
                version: CURRENT_VERSION,
                name: "alice".to_string(),
                role: "user".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_join_rejection_carries_reason() {
        let response = frame(&RelayMessage::JoinResponse(JoinResponseMessage::rejected(
            CURRENT_VERSION,
            RejectReason::NameTaken,
        )));
        let mut reader = FrameReader::new(tokio_test::io::Builder::new().read(&response).build());

        let result = join_relay(&mut reader, &mut Vec::new(), &SequenceCounter::new(), &config()).await;

        assert!(matches!(result, Err(ClientError::Rejected(RejectReason::NameTaken))));
    }

    #[tokio::test]
    async fn test_join_answered_with_other_frame_is_unexpected() {
        let response = frame(&RelayMessage::Ping(1));
        let mut reader = FrameReader::new(tokio_test::io::Builder::new().read(&response).build());

        let result = join_relay(&mut reader, &mut Vec::new(), &SequenceCounter::new(), &config()).await;

        assert!(matches!(result, Err(ClientError::UnexpectedResponse(_))));
    }

    #[tokio::test]
    async fn test_join_answered_with_eof_is_server_closed() {
        let mut reader = FrameReader::new(tokio_test::io::Builder::new().build());

        let result = join_relay(&mut reader, &mut Vec::new(), &SequenceCounter::new(), &config()).await;

        assert!(matches!(
            result,
            Err(ClientError::ConnectionBroken(BrokenCause::ServerClosed))
        ));
    }

    #[test]
    fn test_disconnect_reasons_map_to_distinct_causes() {
        assert_eq!(BrokenCause::from(DisconnectReason::Kicked), BrokenCause::Kicked);
        assert_eq!(
            BrokenCause::from(DisconnectReason::ServerShutdown),
            BrokenCause::ServerShutdown
        );
        assert_ne!(
            BrokenCause::Kicked.to_string(),
            BrokenCause::ServerShutdown.to_string()
        );
    }

    #[test]
    fn test_only_the_first_ending_is_reported() {
        // Arrange
        let (status, _rx) = watch::channel(ConnectionStatus::Active);

        // Act
        let first = end_connection(&status, ConnectionStatus::Broken(BrokenCause::Kicked));
        let second = end_connection(&status, ConnectionStatus::Left);

        // Assert
        assert!(first);
        assert!(!second);
        assert_eq!(*status.borrow(), ConnectionStatus::Broken(BrokenCause::Kicked));
    }

    #[test]
    fn test_config_defaults_to_user_role() {
        let cfg = config().with_role("User");
        assert_eq!(cfg.role, "User");
        assert_eq!(config().role, "user");
        assert_eq!(config().handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
    }
}
