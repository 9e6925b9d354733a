//! Async framing over any byte stream.
//!
//! [`FrameReader`] turns an `AsyncRead` into a sequence of decoded frames,
//! and [`write_message`] puts one encoded frame on an `AsyncWrite`.  Both are
//! generic so the same code drives a `TcpStream` half in production and a
//! scripted `tokio_test::io::Mock` in tests.
//!
//! `FrameReader::read_frame` is cancel-safe: all partial state lives in the
//! reader, so it can sit in a `tokio::select!` next to a timer or a shutdown
//! signal without losing bytes.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::protocol::codec::{current_timestamp_us, encode_message, FrameDecoder, ProtocolError};
use crate::protocol::messages::{FrameHeader, RelayMessage};
use crate::protocol::sequence::SequenceCounter;

const READ_CHUNK: usize = 4096;

/// Failures while reading or writing frames on a stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer closed the stream with part of a frame still buffered.
    #[error("connection closed mid-frame with {buffered} bytes buffered")]
    TruncatedFrame { buffered: usize },
}

/// Reads complete frames from a byte stream.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Returns the next frame, or `Ok(None)` when the peer closed the stream
    /// cleanly on a frame boundary.
    ///
    /// # Errors
    ///
    /// - [`StreamError::Protocol`] for undecodable bytes.
    /// - [`StreamError::TruncatedFrame`] for EOF in the middle of a frame.
    /// - [`StreamError::Io`] for transport failures.
    pub async fn read_frame(&mut self) -> Result<Option<(FrameHeader, RelayMessage)>, StreamError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                trace!(
                    seq = frame.0.sequence_number,
                    msg_type = ?frame.0.message_type,
                    "frame received"
                );
                return Ok(Some(frame));
            }

            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                return match self.decoder.buffered() {
                    0 => Ok(None),
                    buffered => Err(StreamError::TruncatedFrame { buffered }),
                };
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }

    /// Convenience wrapper that drops the header.
    pub async fn read_message(&mut self) -> Result<Option<RelayMessage>, StreamError> {
        Ok(self.read_frame().await?.map(|(_, msg)| msg))
    }
}

/// Encodes `msg` with the next sequence number and the current time and
/// writes it in full.
///
/// # Errors
///
/// [`StreamError::Protocol`] if the message cannot be encoded,
/// [`StreamError::Io`] if the write fails.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &RelayMessage,
    sequence: &SequenceCounter,
) -> Result<(), StreamError> {
    write_message_at(writer, msg, current_timestamp_us(), sequence).await
}

/// Like [`write_message`] but with an explicit header timestamp, used when
/// forwarding a package under its sender's original timestamp.
///
/// # Errors
///
/// Same as [`write_message`].
pub async fn write_message_at<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &RelayMessage,
    timestamp_us: u64,
    sequence: &SequenceCounter,
) -> Result<(), StreamError> {
    let seq = sequence.next();
    let bytes = encode_message(msg, seq, timestamp_us)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    trace!(seq, msg_type = ?msg.message_type(), len = bytes.len(), "frame sent");
    Ok(())
}
