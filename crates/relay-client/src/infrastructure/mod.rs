//! Infrastructure layer for the client.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `relay_core`, but MUST NOT be imported by the `application` layer.
//!
//! # Sub-modules
//!
//! - **`network`** – TCP connection to the relay: join handshake, framed
//!   reads and writes, automatic `Pong` replies, and the event stream.

pub mod network;
