//! # relay-core
//!
//! Shared library for the classroom relay: the wire protocol, its codec, and
//! the domain rules both the server and the client agree on.
//!
//! It opens no sockets and reads no files.  The stream helpers are generic
//! over `AsyncRead`/`AsyncWrite`; the binaries decide what they run on.
//!
//! # Architecture overview (for beginners)
//!
//! The classroom relay is a small chat hub.  Students run a client, join the
//! server under a unique name, and send *packages* (text or other content)
//! either to everyone or to a list of names.  The server never stores
//! packages; it forwards each one to whoever is addressed and online.
//!
//! This crate (`relay-core`) is the shared foundation.  It defines:
//!
//! - **`domain`** – Pure rules with no I/O: what a valid name is, how
//!   recipients are matched, which versions can talk, why a join is refused.
//!
//! - **`protocol`** – How bytes travel over the network.  Messages are
//!   encoded into a compact binary format (24-byte header + payload) and
//!   decoded back into typed Rust values on the other end.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `relay_core::Identity` instead of `relay_core::domain::identity::Identity`.
pub use domain::admission::RejectReason;
pub use domain::identity::{Identity, Role};
pub use domain::package::{Package, Recipients};
pub use domain::version::{AppVersion, CURRENT_VERSION};
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::messages::RelayMessage;
