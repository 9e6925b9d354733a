//! Server-side session state machine.
//!
//! Every accepted connection owns one [`SessionState`].  The connection
//! driver feeds it [`SessionEvent`]s and gets back either the next state or
//! an [`IllegalTransition`] error, so "broadcast to a closing session" or
//! "admit twice" cannot be expressed by accident.
//!
//! ```text
//! Connecting ──Accepted──► Handshaking ──Admitted──► Active ──CloseRequested──► Closing ──Released──► Closed
//!                               │                                                   ▲
//!                               ├──Rejected──► Rejected                             │
//!                               └──Aborted───────────────────────────────────────► Closed
//! ```
//!
//! `Aborted` covers a handshake that never produced a join request (timeout,
//! EOF, garbage).  Such a connection was never a member, so there is nothing
//! to announce and it skips `Closing`.

use std::fmt;
use std::time::SystemTime;

use relay_core::protocol::messages::DisconnectReason;
use relay_core::{Identity, RejectReason};
use thiserror::Error;

/// Why an active member stopped being a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaveCause {
    /// The client sent `Disconnect(ClientLeaving)`.
    ClientLeft,
    /// The socket hit EOF or an I/O error.
    ConnectionLost,
    /// The operator kicked the member.
    Kicked,
    /// The server is shutting down.
    ServerShutdown,
    /// Keepalive expired, or the outbound queue overflowed.
    Unresponsive,
    /// The client sent bytes or messages the protocol does not allow.
    ProtocolViolation,
}

impl LeaveCause {
    /// The reason to send to the peer before closing, if the server is the
    /// one closing the connection.
    pub fn disconnect_reason(self) -> Option<DisconnectReason> {
        match self {
            LeaveCause::ClientLeft | LeaveCause::ConnectionLost => None,
            LeaveCause::Kicked => Some(DisconnectReason::Kicked),
            LeaveCause::ServerShutdown => Some(DisconnectReason::ServerShutdown),
            LeaveCause::Unresponsive => Some(DisconnectReason::Unresponsive),
            LeaveCause::ProtocolViolation => Some(DisconnectReason::ProtocolViolation),
        }
    }

    /// Inverse of [`disconnect_reason`](Self::disconnect_reason) for a close
    /// signal received from the relay.
    pub fn from_disconnect_reason(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::ClientLeaving => LeaveCause::ClientLeft,
            DisconnectReason::Kicked => LeaveCause::Kicked,
            DisconnectReason::ServerShutdown => LeaveCause::ServerShutdown,
            DisconnectReason::Unresponsive => LeaveCause::Unresponsive,
            DisconnectReason::ProtocolViolation => LeaveCause::ProtocolViolation,
        }
    }
}

impl fmt::Display for LeaveCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LeaveCause::ClientLeft => "left",
            LeaveCause::ConnectionLost => "connection lost",
            LeaveCause::Kicked => "kicked",
            LeaveCause::ServerShutdown => "server shutdown",
            LeaveCause::Unresponsive => "unresponsive",
            LeaveCause::ProtocolViolation => "protocol violation",
        };
        f.write_str(text)
    }
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Active {
        identity: Identity,
        joined_at: SystemTime,
    },
    Closing {
        identity: Identity,
        cause: LeaveCause,
    },
    Closed,
    Rejected(RejectReason),
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Accepted,
    Admitted(Identity),
    Rejected(RejectReason),
    Aborted,
    CloseRequested(LeaveCause),
    Released,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal session transition: {event} in state {state}")]
pub struct IllegalTransition {
    pub state: &'static str,
    pub event: &'static str,
}

impl SessionState {
    pub fn new() -> Self {
        SessionState::Connecting
    }

    /// Applies `event` and returns the next state.
    ///
    /// # Errors
    ///
    /// [`IllegalTransition`] when the event makes no sense in the current
    /// state.  The current state is consumed either way; callers keep a copy
    /// if they need to recover.
    pub fn on(self, event: SessionEvent) -> Result<SessionState, IllegalTransition> {
        match (self, event) {
            (SessionState::Connecting, SessionEvent::Accepted) => Ok(SessionState::Handshaking),
            (SessionState::Handshaking, SessionEvent::Admitted(identity)) => {
                Ok(SessionState::Active {
                    identity,
                    joined_at: SystemTime::now(),
                })
            }
            (SessionState::Handshaking, SessionEvent::Rejected(reason)) => {
                Ok(SessionState::Rejected(reason))
            }
            (SessionState::Connecting | SessionState::Handshaking, SessionEvent::Aborted) => {
                Ok(SessionState::Closed)
            }
            (SessionState::Active { identity, .. }, SessionEvent::CloseRequested(cause)) => {
                Ok(SessionState::Closing { identity, cause })
            }
            // A second close request (kick racing with EOF) keeps the first cause.
            (closing @ SessionState::Closing { .. }, SessionEvent::CloseRequested(_)) => Ok(closing),
            (SessionState::Closing { .. }, SessionEvent::Released) => Ok(SessionState::Closed),
            (state, event) => Err(IllegalTransition {
                state: state.name(),
                event: event.name(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Connecting => "Connecting",
            SessionState::Handshaking => "Handshaking",
            SessionState::Active { .. } => "Active",
            SessionState::Closing { .. } => "Closing",
            SessionState::Closed => "Closed",
            SessionState::Rejected(_) => "Rejected",
        }
    }

    /// The member identity while the session is (or was just) a member.
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            SessionState::Active { identity, .. } | SessionState::Closing { identity, .. } => {
                Some(identity)
            }
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active { .. })
    }

    /// `true` for `Closed` and `Rejected`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Rejected(_))
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEvent {
    fn name(&self) -> &'static str {
        match self {
            SessionEvent::Accepted => "Accepted",
            SessionEvent::Admitted(_) => "Admitted",
            SessionEvent::Rejected(_) => "Rejected",
            SessionEvent::Aborted => "Aborted",
            SessionEvent::CloseRequested(_) => "CloseRequested",
            SessionEvent::Released => "Released",
        }
    }
}
