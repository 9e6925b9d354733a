//! All relay protocol message types.
//!
//! Every message travels in a frame with the common 24-byte header described
//! in [`crate::protocol::codec`]; this module only defines the payloads.

use serde::{Deserialize, Serialize};

use crate::domain::admission::RejectReason;
use crate::domain::identity::Role;
use crate::domain::package::Recipients;
use crate::domain::version::AppVersion;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current frame format version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Total size of the common frame header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Largest payload a frame may declare.  Anything larger is treated as a
/// corrupt length field rather than buffered.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

// ── Message type codes ────────────────────────────────────────────────────────

/// Discriminator byte in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Join = 0x01,
    JoinResponse = 0x02,
    Package = 0x03,
    UserList = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    Disconnect = 0x07,
    Error = 0x08,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageType::Join),
            0x02 => Ok(MessageType::JoinResponse),
            0x03 => Ok(MessageType::Package),
            0x04 => Ok(MessageType::UserList),
            0x05 => Ok(MessageType::Ping),
            0x06 => Ok(MessageType::Pong),
            0x07 => Ok(MessageType::Disconnect),
            0x08 => Ok(MessageType::Error),
            _ => Err(()),
        }
    }
}

// ── Common frame header ───────────────────────────────────────────────────────

/// 24-byte header prepended to every message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Frame format version; always [`PROTOCOL_VERSION`].
    pub version: u8,
    /// Identifies the payload type.
    pub message_type: MessageType,
    /// Length of the payload in bytes (not including this header).
    pub payload_length: u32,
    /// Monotonically increasing per-connection counter.
    pub sequence_number: u64,
    /// Microseconds since Unix epoch at time of generation.
    pub timestamp_us: u64,
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// JOIN (0x01): first message a client sends after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinMessage {
    /// Version of the client implementation.
    pub version: AppVersion,
    /// Requested member name.
    pub name: String,
    /// Requested role, as typed by the client (validated by the server).
    pub role: String,
}

/// JOIN_RESPONSE (0x02): the server's verdict on a join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponseMessage {
    /// Version of the server implementation.
    pub server_version: AppVersion,
    /// `None` when the client was admitted.
    pub rejection: Option<RejectReason>,
}

impl JoinResponseMessage {
    pub fn accepted(server_version: AppVersion) -> Self {
        Self {
            server_version,
            rejection: None,
        }
    }

    pub fn rejected(server_version: AppVersion, reason: RejectReason) -> Self {
        Self {
            server_version,
            rejection: Some(reason),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.rejection.is_none()
    }
}

/// PACKAGE (0x03): user content in either direction.
///
/// Clients may leave `sender` empty; the server always overwrites it with the
/// identity of the session the package arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMessage {
    pub sender: String,
    pub recipients: Recipients,
    pub content_type: String,
    pub payload: Vec<u8>,
}

impl PackageMessage {
    /// Size of this message's frame payload once encoded.
    ///
    /// The server compares this against [`MAX_PAYLOAD_LEN`] after stamping
    /// the sender, since a longer sender name can push a package that arrived
    /// within the limit over it.
    pub fn encoded_len(&self) -> usize {
        let recipients = match &self.recipients {
            Recipients::All => 1,
            Recipients::Names(names) => 1 + 2 + names.iter().map(|n| 2 + n.len()).sum::<usize>(),
        };
        2 + self.sender.len() + recipients + 2 + self.content_type.len() + 4 + self.payload.len()
    }
}

/// One row of a USER_LIST message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub role: Role,
}

/// Why a connection is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisconnectReason {
    /// The client is leaving on its own.
    ClientLeaving = 0x01,
    /// The operator kicked this member.
    Kicked = 0x02,
    /// The server is shutting down.
    ServerShutdown = 0x03,
    /// The peer stopped answering or could not keep up with its queue.
    Unresponsive = 0x04,
    /// The peer sent something the protocol does not allow.
    ProtocolViolation = 0x05,
}

impl TryFrom<u8> for DisconnectReason {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(DisconnectReason::ClientLeaving),
            0x02 => Ok(DisconnectReason::Kicked),
            0x03 => Ok(DisconnectReason::ServerShutdown),
            0x04 => Ok(DisconnectReason::Unresponsive),
            0x05 => Ok(DisconnectReason::ProtocolViolation),
            _ => Err(()),
        }
    }
}

/// Error codes carried by ERROR (0x08).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProtocolErrorCode {
    MalformedFrame = 0x01,
    UnknownMessageType = 0x02,
    UnexpectedMessage = 0x03,
    UnsupportedVersion = 0x04,
    /// The package was well-formed but refused (bad content type, ...).
    /// The connection stays open.
    InvalidPackage = 0x05,
    HandshakeTimeout = 0x06,
}

impl TryFrom<u8> for ProtocolErrorCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ProtocolErrorCode::MalformedFrame),
            0x02 => Ok(ProtocolErrorCode::UnknownMessageType),
            0x03 => Ok(ProtocolErrorCode::UnexpectedMessage),
            0x04 => Ok(ProtocolErrorCode::UnsupportedVersion),
            0x05 => Ok(ProtocolErrorCode::InvalidPackage),
            0x06 => Ok(ProtocolErrorCode::HandshakeTimeout),
            _ => Err(()),
        }
    }
}

/// ERROR (0x08): human-readable problem report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error_code: ProtocolErrorCode,
    pub description: String,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// Every message the relay protocol knows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMessage {
    Join(JoinMessage),
    JoinResponse(JoinResponseMessage),
    Package(PackageMessage),
    UserList(Vec<UserEntry>),
    Ping(u64),
    Pong(u64),
    Disconnect { reason: DisconnectReason },
    Error(ErrorMessage),
}

impl RelayMessage {
    /// Returns the header discriminator for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            RelayMessage::Join(_) => MessageType::Join,
            RelayMessage::JoinResponse(_) => MessageType::JoinResponse,
            RelayMessage::Package(_) => MessageType::Package,
            RelayMessage::UserList(_) => MessageType::UserList,
            RelayMessage::Ping(_) => MessageType::Ping,
            RelayMessage::Pong(_) => MessageType::Pong,
            RelayMessage::Disconnect { .. } => MessageType::Disconnect,
            RelayMessage::Error(_) => MessageType::Error,
        }
    }
}
