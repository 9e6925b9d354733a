//! Binary codec for encoding and decoding relay protocol messages.
//!
//! Wire format:
//! ```text
//! [version:1][msg_type:1][reserved:2][payload_len:4][seq:8][timestamp_us:8][payload:N]
//! ```
//! Total header size: 24 bytes. All multi-byte integers are big-endian.
//! Strings are prefixed with a u16 byte length, byte blobs with a u32.
//!
//! TCP is a byte stream, so a read may deliver half a frame or several frames
//! at once.  [`FrameDecoder`] buffers bytes and hands out complete messages;
//! an incomplete frame is not an error, the caller just feeds more bytes.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::domain::admission::RejectReason;
use crate::domain::identity::Role;
use crate::domain::package::Recipients;
use crate::domain::version::AppVersion;
use crate::protocol::messages::{
    DisconnectReason, ErrorMessage, FrameHeader, JoinMessage, JoinResponseMessage, MessageType,
    PackageMessage, ProtocolErrorCode, RelayMessage, UserEntry, HEADER_SIZE, MAX_PAYLOAD_LEN,
    PROTOCOL_VERSION,
};

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// Not enough bytes yet for a complete frame.  Not a failure on a stream:
    /// buffer more and retry.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The message type byte in the header is not a recognized value.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The frame version in the header is not supported.
    #[error("unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    /// The header itself is corrupt (length out of range, reserved bits set).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The payload could not be parsed (field value out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A message is too big to be framed.
    #[error("payload too large: {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
}

impl ProtocolError {
    /// `true` when the frame is merely incomplete.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::InsufficientData { .. })
    }

    /// `true` when the connection that produced this error must be closed.
    pub fn is_fatal(&self) -> bool {
        !self.is_incomplete()
    }

    /// The code to report to the peer in an `Error` message.
    pub fn error_code(&self) -> ProtocolErrorCode {
        match self {
            ProtocolError::UnknownMessageType(_) => ProtocolErrorCode::UnknownMessageType,
            ProtocolError::UnsupportedVersion(_) => ProtocolErrorCode::UnsupportedVersion,
            _ => ProtocolErrorCode::MalformedFrame,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`RelayMessage`] into a byte vector including the 24-byte header.
///
/// The sequence number is **not** set by this function – pass a pre-incremented
/// value from a [`crate::protocol::SequenceCounter`].
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_LEN`] or a length-prefixed field overflows its prefix.
///
/// # Examples
///
/// ```rust
/// use relay_core::protocol::{encode_message, decode_message};
/// use relay_core::protocol::messages::RelayMessage;
///
/// let msg = RelayMessage::Ping(42);
/// let bytes = encode_message(&msg, 0, 0).unwrap();
/// let (decoded, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(
    msg: &RelayMessage,
    sequence_number: u64,
    timestamp_us: u64,
) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(msg)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let payload_len = payload.len() as u32;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(PROTOCOL_VERSION);
    buf.push(msg.message_type() as u8);
    buf.push(0x00); // reserved
    buf.push(0x00); // reserved
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(&sequence_number.to_be_bytes());
    buf.extend_from_slice(&timestamp_us.to_be_bytes());

    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Encodes a [`RelayMessage`] using the current system time as the timestamp.
///
/// # Errors
///
/// Same as [`encode_message`].
pub fn encode_message_now(
    msg: &RelayMessage,
    sequence_number: u64,
) -> Result<Vec<u8>, ProtocolError> {
    encode_message(msg, sequence_number, current_timestamp_us())
}

/// Microseconds since the Unix epoch, or 0 if the clock is before it.
pub fn current_timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Decodes one message from the beginning of `bytes`.
///
/// Returns the message and the number of bytes consumed (header + payload).
///
/// # Errors
///
/// See [`decode_frame`].
pub fn decode_message(bytes: &[u8]) -> Result<(RelayMessage, usize), ProtocolError> {
    decode_frame(bytes).map(|(_, msg, consumed)| (msg, consumed))
}

/// Decodes one frame from the beginning of `bytes`, returning its header too.
///
/// The header is validated as soon as its 24 bytes are available, so a
/// corrupt length or an unknown type is reported without waiting for a
/// payload that may never come.
///
/// # Errors
///
/// - [`ProtocolError::InsufficientData`] if the frame is not complete yet.
/// - [`ProtocolError::UnsupportedVersion`], [`ProtocolError::UnknownMessageType`]
///   or [`ProtocolError::MalformedFrame`] for a bad header.
/// - [`ProtocolError::MalformedPayload`] if the payload does not parse.
pub fn decode_frame(bytes: &[u8]) -> Result<(FrameHeader, RelayMessage, usize), ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let msg_type_byte = bytes[1];
    let msg_type = MessageType::try_from(msg_type_byte)
        .map_err(|_| ProtocolError::UnknownMessageType(msg_type_byte))?;

    if bytes[2] != 0 || bytes[3] != 0 {
        return Err(ProtocolError::MalformedFrame(format!(
            "reserved bytes must be zero, got 0x{:02X}{:02X}",
            bytes[2], bytes[3]
        )));
    }

    let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::MalformedFrame(format!(
            "declared payload length {payload_len} exceeds {MAX_PAYLOAD_LEN}"
        )));
    }

    let total_needed = HEADER_SIZE + payload_len;
    if bytes.len() < total_needed {
        return Err(ProtocolError::InsufficientData {
            needed: total_needed,
            available: bytes.len(),
        });
    }

    let mut header_fields = Cursor::new(&bytes[8..HEADER_SIZE]);
    let sequence_number = header_fields.u64()?;
    let timestamp_us = header_fields.u64()?;
    let header = FrameHeader {
        version,
        message_type: msg_type,
        payload_length: payload_len as u32,
        sequence_number,
        timestamp_us,
    };

    let msg = decode_payload(msg_type, &bytes[HEADER_SIZE..total_needed])?;
    Ok((header, msg, total_needed))
}

// ── Streaming decoder ─────────────────────────────────────────────────────────

/// Accumulates stream bytes and yields complete frames.
///
/// # Example
///
/// ```rust
/// use relay_core::protocol::{encode_message, FrameDecoder};
/// use relay_core::protocol::messages::RelayMessage;
///
/// let bytes = encode_message(&RelayMessage::Ping(1), 0, 0).unwrap();
/// let mut decoder = FrameDecoder::new();
/// decoder.extend(&bytes[..10]);
/// assert!(decoder.next_frame().unwrap().is_none());
/// decoder.extend(&bytes[10..]);
/// let (_, msg) = decoder.next_frame().unwrap().unwrap();
/// assert_eq!(msg, RelayMessage::Ping(1));
/// ```
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pops the next complete frame, or `Ok(None)` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Any fatal [`ProtocolError`].  After an error the buffer content is
    /// unspecified and the connection should be closed.
    pub fn next_frame(&mut self) -> Result<Option<(FrameHeader, RelayMessage)>, ProtocolError> {
        match decode_frame(&self.buf) {
            Ok((header, msg, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some((header, msg)))
            }
            Err(e) if e.is_incomplete() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(msg: &RelayMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    match msg {
        RelayMessage::Join(m) => encode_join(&mut buf, m)?,
        RelayMessage::JoinResponse(m) => encode_join_response(&mut buf, m),
        RelayMessage::Package(m) => encode_package(&mut buf, m)?,
        RelayMessage::UserList(users) => encode_user_list(&mut buf, users)?,
        RelayMessage::Ping(token) => buf.extend_from_slice(&token.to_be_bytes()),
        RelayMessage::Pong(token) => buf.extend_from_slice(&token.to_be_bytes()),
        RelayMessage::Disconnect { reason } => buf.push(*reason as u8),
        RelayMessage::Error(m) => {
            buf.push(m.error_code as u8);
            write_string(&mut buf, &m.description)?;
        }
    }
    Ok(buf)
}

fn encode_version(buf: &mut Vec<u8>, v: &AppVersion) {
    buf.extend_from_slice(&v.major.to_be_bytes());
    buf.extend_from_slice(&v.minor.to_be_bytes());
    buf.extend_from_slice(&v.patch.to_be_bytes());
}

fn encode_join(buf: &mut Vec<u8>, m: &JoinMessage) -> Result<(), ProtocolError> {
    encode_version(buf, &m.version);
    write_string(buf, &m.name)?;
    write_string(buf, &m.role)
}

fn encode_join_response(buf: &mut Vec<u8>, m: &JoinResponseMessage) {
    encode_version(buf, &m.server_version);
    match m.rejection {
        None => buf.extend_from_slice(&[0x01, 0x00]),
        Some(reason) => buf.extend_from_slice(&[0x00, reason.code()]),
    }
}

fn encode_package(buf: &mut Vec<u8>, m: &PackageMessage) -> Result<(), ProtocolError> {
    write_string(buf, &m.sender)?;
    match &m.recipients {
        Recipients::All => buf.push(0x00),
        Recipients::Names(names) => {
            buf.push(0x01);
            write_count(buf, names.len())?;
            for name in names {
                write_string(buf, name)?;
            }
        }
    }
    write_string(buf, &m.content_type)?;
    if m.payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            size: m.payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    buf.extend_from_slice(&(m.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&m.payload);
    Ok(())
}

fn encode_user_list(buf: &mut Vec<u8>, users: &[UserEntry]) -> Result<(), ProtocolError> {
    write_count(buf, users.len())?;
    for user in users {
        write_string(buf, &user.name)?;
        write_string(buf, user.role.as_str())?;
    }
    Ok(())
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_payload(msg_type: MessageType, payload: &[u8]) -> Result<RelayMessage, ProtocolError> {
    let mut cur = Cursor::new(payload);
    let msg = match msg_type {
        MessageType::Join => RelayMessage::Join(JoinMessage {
            version: decode_version(&mut cur)?,
            name: cur.string()?,
            role: cur.string()?,
        }),
        MessageType::JoinResponse => RelayMessage::JoinResponse(decode_join_response(&mut cur)?),
        MessageType::Package => RelayMessage::Package(decode_package(&mut cur)?),
        MessageType::UserList => RelayMessage::UserList(decode_user_list(&mut cur)?),
        MessageType::Ping => RelayMessage::Ping(cur.u64()?),
        MessageType::Pong => RelayMessage::Pong(cur.u64()?),
        MessageType::Disconnect => {
            let code = cur.u8()?;
            let reason = DisconnectReason::try_from(code).map_err(|_| {
                ProtocolError::MalformedPayload(format!("unknown disconnect reason: {code}"))
            })?;
            RelayMessage::Disconnect { reason }
        }
        MessageType::Error => {
            let code = cur.u8()?;
            let error_code = ProtocolErrorCode::try_from(code).map_err(|_| {
                ProtocolError::MalformedPayload(format!("unknown error code: {code}"))
            })?;
            RelayMessage::Error(ErrorMessage {
                error_code,
                description: cur.string()?,
            })
        }
    };
    cur.finish(msg_type)?;
    Ok(msg)
}

fn decode_version(cur: &mut Cursor<'_>) -> Result<AppVersion, ProtocolError> {
    Ok(AppVersion::new(cur.u16()?, cur.u16()?, cur.u16()?))
}

fn decode_join_response(cur: &mut Cursor<'_>) -> Result<JoinResponseMessage, ProtocolError> {
    let server_version = decode_version(cur)?;
    let accepted = cur.u8()?;
    let code = cur.u8()?;
    let rejection = match (accepted, code) {
        (0x01, 0x00) => None,
        (0x00, code) => Some(RejectReason::try_from(code).map_err(|_| {
            ProtocolError::MalformedPayload(format!("unknown reject reason: {code}"))
        })?),
        (flag, code) => {
            return Err(ProtocolError::MalformedPayload(format!(
                "inconsistent join response: accepted={flag}, reason={code}"
            )))
        }
    };
    Ok(JoinResponseMessage {
        server_version,
        rejection,
    })
}

fn decode_package(cur: &mut Cursor<'_>) -> Result<PackageMessage, ProtocolError> {
    let sender = cur.string()?;
    let recipients = match cur.u8()? {
        0x00 => Recipients::All,
        0x01 => {
            let count = cur.u16()? as usize;
            let mut names = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                names.push(cur.string()?);
            }
            Recipients::Names(names)
        }
        tag => {
            return Err(ProtocolError::MalformedPayload(format!(
                "unknown recipients tag: {tag}"
            )))
        }
    };
    let content_type = cur.string()?;
    let payload = cur.blob()?;
    Ok(PackageMessage {
        sender,
        recipients,
        content_type,
        payload,
    })
}

fn decode_user_list(cur: &mut Cursor<'_>) -> Result<Vec<UserEntry>, ProtocolError> {
    let count = cur.u16()? as usize;
    let mut users = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let name = cur.string()?;
        let role_text = cur.string()?;
        let role = role_text.parse::<Role>().map_err(|_| {
            ProtocolError::MalformedPayload(format!("unknown role in user list: {role_text}"))
        })?;
        users.push(UserEntry { name, role });
    }
    Ok(users)
}

// ── Utility helpers ───────────────────────────────────────────────────────────

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| ProtocolError::PayloadTooLarge {
        size: bytes.len(),
        max: u16::MAX as usize,
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn write_count(buf: &mut Vec<u8>, count: usize) -> Result<(), ProtocolError> {
    let count = u16::try_from(count).map_err(|_| ProtocolError::PayloadTooLarge {
        size: count,
        max: u16::MAX as usize,
    })?;
    buf.extend_from_slice(&count.to_be_bytes());
    Ok(())
}

/// Bounds-checked reader over a payload slice.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(ProtocolError::MalformedPayload(format!(
                "need {n} bytes at offset {}, only {} left",
                self.pos,
                self.buf.len() - self.pos
            ))),
        }
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))
    }

    fn blob(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Rejects payloads with bytes left over after the last field.
    fn finish(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(ProtocolError::MalformedPayload(format!(
                "{msg_type:?}: {} trailing bytes",
                self.buf.len() - self.pos
            )))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
