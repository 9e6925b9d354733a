//! Protocol module: message types, the binary codec, and stream framing.

pub mod codec;
pub mod messages;
pub mod sequence;
pub mod stream;

pub use codec::{
    current_timestamp_us, decode_frame, decode_message, encode_message, encode_message_now,
    FrameDecoder, ProtocolError,
};
pub use messages::*;
pub use sequence::SequenceCounter;
pub use stream::{write_message, write_message_at, FrameReader, StreamError};
