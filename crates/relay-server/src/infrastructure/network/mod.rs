//! Network infrastructure for the relay server.
//!
//! # Sub-modules
//!
//! - **`relay_server`** – Binds the TCP listener, runs the accept loop and
//!   hands out the [`relay_server::RelayServer`] handle used to administer
//!   and stop the relay.
//!
//! - **`connection`** – Drives one accepted connection: handshake with a
//!   timeout, the member loop with keepalive pings, and a writer task fed
//!   by a bounded queue so one slow client never stalls the others.

pub mod connection;
pub mod relay_server;

pub use relay_server::{NetworkError, RelayServer, ServerSettings};
