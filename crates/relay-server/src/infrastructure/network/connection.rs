//! Per-connection session driver.
//!
//! Each accepted TCP connection runs [`run_session`] in its own Tokio task.
//! The task owns the read half and a [`SessionState`]; a second task owns
//! the write half and drains the session's bounded outbound queue.
//!
//! ```text
//!            ┌──────────── reader (this task) ────────────┐
//! socket ──► │ FrameReader ─► SessionDriver ─► RelayService│──► other members' queues
//!            └────────────────────────────────────────────┘
//!            ┌──────────── writer task ───────────────────┐
//! socket ◄── │ write_message_at ◄─ mpsc queue ◄─ Mailbox  │◄── RelayService
//!            └────────────────────────────────────────────┘
//! ```
//!
//! # Closing (for beginners)
//!
//! The relay closes a member by calling [`Mailbox::close`], which only flips
//! a `tokio::sync::watch` value.  Both tasks watch it: the reader stops
//! reading, the writer sends the `Disconnect` frame and shuts the socket.
//! Flipping a watch value never waits, so the relay can close a member whose
//! queue is completely full.
//!
//! The writer flips the same value when the socket fails under it, so the
//! reader ends the membership right away.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relay_core::protocol::messages::{
    DisconnectReason, ErrorMessage, FrameHeader, JoinMessage, JoinResponseMessage,
    ProtocolErrorCode, RelayMessage,
};
use relay_core::protocol::{write_message, write_message_at, FrameReader, SequenceCounter, StreamError};
use relay_core::CURRENT_VERSION;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::application::registry::{DeliveryError, Mailbox, Outbound, SessionId};
use crate::application::relay::{RelayError, RelayService};
use crate::application::session::{LeaveCause, SessionEvent, SessionState};
use crate::infrastructure::storage::config::LimitsConfig;

/// The relay service as shared between connection tasks.
pub type SharedRelay = Arc<Mutex<RelayService>>;

/// How long the writer may take to flush after the session ends.
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Timers and queue sizes applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub outbound_queue_capacity: usize,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

impl From<&LimitsConfig> for SessionLimits {
    fn from(cfg: &LimitsConfig) -> Self {
        Self {
            outbound_queue_capacity: cfg.outbound_queue_capacity.max(1),
            handshake_timeout: cfg.handshake_timeout(),
            keepalive_interval: cfg.keepalive_interval(),
        }
    }
}

// ── Mailbox backed by channels ────────────────────────────────────────────────

/// [`Mailbox`] implementation feeding the session's writer task.
pub struct ChannelMailbox {
    frames: mpsc::Sender<Outbound>,
    close: Arc<watch::Sender<Option<DisconnectReason>>>,
}

impl Mailbox for ChannelMailbox {
    fn try_deliver(&self, frame: Outbound) -> Result<(), DeliveryError> {
        self.frames.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn close(&self, reason: DisconnectReason) {
        request_close(&self.close, reason);
    }
}

/// Records `reason` unless the session is already closing.  First reason wins.
fn request_close(close: &watch::Sender<Option<DisconnectReason>>, reason: DisconnectReason) {
    close.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Drives one accepted connection from handshake to close.
///
/// `shutdown` flips to `true` when the server stops; a connection that has
/// not joined yet gives up at that point.  Members are closed through their
/// mailbox instead.
pub async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    relay: SharedRelay,
    limits: SessionLimits,
    shutdown: watch::Receiver<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let (frames_tx, frames_rx) = mpsc::channel(limits.outbound_queue_capacity.max(1));
    let (close_tx, close_rx) = watch::channel(None);
    let close_tx = Arc::new(close_tx);
    let mut writer = tokio::spawn(
        run_writer(write_half, frames_rx, close_rx.clone(), Arc::clone(&close_tx))
            .in_current_span(),
    );
    let mailbox = Arc::new(ChannelMailbox {
        frames: frames_tx,
        close: close_tx,
    });

    let mut driver = SessionDriver {
        session: Uuid::new_v4(),
        peer,
        relay,
        limits,
        mailbox,
        reader: FrameReader::new(read_half),
        close_signal: close_rx,
        shutdown,
        state: SessionState::new(),
    };
    driver.run().await;
    let final_state = driver.state.name();
    // Dropping the driver drops our mailbox handle; the registry no longer
    // holds one, so the writer sees the end of its queue.
    drop(driver);

    match timeout(WRITER_GRACE, &mut writer).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => debug!(error = %e, "writer stopped with error"),
        Ok(Err(e)) => warn!(error = %e, "writer task failed"),
        Err(_) => {
            warn!("writer did not flush in time; dropping connection");
            writer.abort();
        }
    }
    debug!(state = final_state, "session finished");
}

// ── Reader side ───────────────────────────────────────────────────────────────

struct SessionDriver {
    session: SessionId,
    peer: SocketAddr,
    relay: SharedRelay,
    limits: SessionLimits,
    mailbox: Arc<ChannelMailbox>,
    reader: FrameReader<OwnedReadHalf>,
    close_signal: watch::Receiver<Option<DisconnectReason>>,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
}

impl SessionDriver {
    async fn run(&mut self) {
        self.transition(SessionEvent::Accepted);

        let Some(request) = self.await_join().await else {
            self.transition(SessionEvent::Aborted);
            return;
        };

        let mailbox: Arc<dyn Mailbox> = self.mailbox.clone();
        let joined = self
            .relay
            .lock()
            .await
            .join(self.session, self.peer, &request, mailbox);
        match joined {
            Ok(identity) => {
                tracing::Span::current().record("member", identity.name());
                self.transition(SessionEvent::Admitted(identity));
            }
            Err(reason) => {
                self.send(RelayMessage::JoinResponse(JoinResponseMessage::rejected(
                    CURRENT_VERSION,
                    reason,
                )));
                self.transition(SessionEvent::Rejected(reason));
                return;
            }
        }

        let cause = self.serve_member().await;
        self.transition(SessionEvent::CloseRequested(cause));
        // No-op if the relay already removed us (kick, shutdown, eviction).
        self.relay.lock().await.leave(self.session, cause);
        self.transition(SessionEvent::Released);
    }

    /// Waits for the join request.  `None` means the connection is done.
    async fn await_join(&mut self) -> Option<JoinMessage> {
        let handshake_timeout = self.limits.handshake_timeout;
        let result = tokio::select! {
            read = timeout(handshake_timeout, self.reader.read_message()) => read,
            Ok(()) = self.shutdown.changed() => {
                debug!("server stopping; abandoning handshake");
                return None;
            }
        };

        match result {
            Err(_) => {
                info!("no join request within {handshake_timeout:?}; closing");
                self.send(RelayMessage::Error(ErrorMessage {
                    error_code: ProtocolErrorCode::HandshakeTimeout,
                    description: "no join request received in time".to_string(),
                }));
                None
            }
            Ok(Ok(Some(RelayMessage::Join(request)))) => Some(request),
            Ok(Ok(Some(other))) => {
                self.violation(
                    ProtocolErrorCode::UnexpectedMessage,
                    format!("expected Join, got {:?}", other.message_type()),
                );
                None
            }
            Ok(Ok(None)) => {
                debug!("peer closed before joining");
                None
            }
            Ok(Err(StreamError::Protocol(e))) => {
                self.violation(e.error_code(), e.to_string());
                None
            }
            Ok(Err(e)) => {
                debug!(error = %e, "read failed during handshake");
                None
            }
        }
    }

    /// Runs the member loop and returns why it ended.
    async fn serve_member(&mut self) -> LeaveCause {
        let keepalive = self.limits.keepalive_interval;
        let idle = tokio::time::sleep(keepalive);
        tokio::pin!(idle);
        let mut awaiting_pong = false;
        let mut ping_token: u64 = 0;

        loop {
            tokio::select! {
                changed = self.close_signal.changed() => {
                    let reason = *self.close_signal.borrow_and_update();
                    match (changed, reason) {
                        (_, Some(reason)) => return LeaveCause::from_disconnect_reason(reason),
                        (Err(_), None) => return LeaveCause::ConnectionLost,
                        (Ok(()), None) => {}
                    }
                }
                () = &mut idle => {
                    if awaiting_pong {
                        warn!("keepalive expired");
                        return LeaveCause::Unresponsive;
                    }
                    ping_token = ping_token.wrapping_add(1);
                    self.send(RelayMessage::Ping(ping_token));
                    awaiting_pong = true;
                    idle.as_mut().reset(Instant::now() + keepalive);
                }
                frame = self.reader.read_frame() => match frame {
                    Ok(Some((header, message))) => {
                        awaiting_pong = false;
                        idle.as_mut().reset(Instant::now() + keepalive);
                        if let Some(cause) = self.handle_member_message(header, message).await {
                            return cause;
                        }
                    }
                    Ok(None) => return LeaveCause::ConnectionLost,
                    Err(StreamError::Protocol(e)) => {
                        self.violation(e.error_code(), e.to_string());
                        return LeaveCause::ProtocolViolation;
                    }
                    Err(e) => {
                        debug!(error = %e, "read failed");
                        return LeaveCause::ConnectionLost;
                    }
                },
            }
        }
    }

    async fn handle_member_message(
        &mut self,
        header: FrameHeader,
        message: RelayMessage,
    ) -> Option<LeaveCause> {
        match message {
            RelayMessage::Package(package) => {
                let result = self
                    .relay
                    .lock()
                    .await
                    .submit(self.session, package, header.timestamp_us);
                match result {
                    Ok(_) => {}
                    Err(RelayError::InvalidPackage(description)) => {
                        self.send(RelayMessage::Error(ErrorMessage {
                            error_code: ProtocolErrorCode::InvalidPackage,
                            description,
                        }));
                    }
                    // Already removed; the close signal is on its way.
                    Err(e) => debug!(error = %e, "package not relayed"),
                }
                None
            }
            RelayMessage::Ping(token) => {
                self.send(RelayMessage::Pong(token));
                None
            }
            RelayMessage::Pong(_) => None,
            RelayMessage::Disconnect { reason } => {
                debug!(?reason, "client disconnecting");
                Some(LeaveCause::ClientLeft)
            }
            other => {
                self.violation(
                    ProtocolErrorCode::UnexpectedMessage,
                    format!("{:?} is not allowed from a member", other.message_type()),
                );
                Some(LeaveCause::ProtocolViolation)
            }
        }
    }

    /// Reports a protocol error to the peer and closes the connection.
    fn violation(&self, code: ProtocolErrorCode, description: String) {
        warn!(?code, %description, "protocol violation");
        self.send(RelayMessage::Error(ErrorMessage {
            error_code: code,
            description,
        }));
        self.mailbox.close(DisconnectReason::ProtocolViolation);
    }

    fn send(&self, message: RelayMessage) {
        if let Err(error) = self.mailbox.try_deliver(Outbound::now(message)) {
            debug!(?error, "could not queue frame");
        }
    }

    fn transition(&mut self, event: SessionEvent) {
        match self.state.clone().on(event) {
            Ok(next) => {
                debug!(from = self.state.name(), to = next.name(), "session transition");
                self.state = next;
            }
            Err(e) => warn!(error = %e, "session state machine refused event"),
        }
    }
}

// ── Writer side ───────────────────────────────────────────────────────────────

/// Runs [`write_loop`]; a transport failure closes the session as
/// unresponsive so the member is released without waiting for keepalive.
async fn run_writer<W: AsyncWrite + Unpin>(
    writer: W,
    frames: mpsc::Receiver<Outbound>,
    close_signal: watch::Receiver<Option<DisconnectReason>>,
    close: Arc<watch::Sender<Option<DisconnectReason>>>,
) -> Result<(), StreamError> {
    let result = write_loop(writer, frames, close_signal).await;
    if let Err(e) = &result {
        warn!(error = %e, "writer failed; closing session");
        request_close(&close, DisconnectReason::Unresponsive);
    }
    result
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut frames: mpsc::Receiver<Outbound>,
    mut close: watch::Receiver<Option<DisconnectReason>>,
) -> Result<(), StreamError> {
    let sequence = SequenceCounter::new();

    let reason = loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => write_frame(&mut writer, &frame, &sequence).await?,
                None => break None,
            },
            changed = close.changed() => {
                let reason = *close.borrow_and_update();
                if changed.is_err() || reason.is_some() {
                    break reason;
                }
            }
        }
    };

    if let Some(reason) = reason {
        // A stalled peer would only block on its backlog.
        if reason != DisconnectReason::Unresponsive {
            while let Ok(frame) = frames.try_recv() {
                write_frame(&mut writer, &frame, &sequence).await?;
            }
        }
        write_message(&mut writer, &RelayMessage::Disconnect { reason }, &sequence).await?;
    }
    writer.shutdown().await?;
    debug!(frames_sent = sequence.sent(), "writer finished");
    Ok(())
}

/// Writes one queued frame.  A frame that cannot be encoded is dropped;
/// only transport errors end the writer.
async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Outbound,
    sequence: &SequenceCounter,
) -> Result<(), StreamError> {
    match write_message_at(writer, &frame.message, frame.timestamp_us, sequence).await {
        Err(StreamError::Protocol(e)) => {
            warn!(
                error = %e,
                msg_type = ?frame.message.message_type(),
                "dropping frame that cannot be encoded"
            );
            Ok(())
        }
        other => other,
    }
}
