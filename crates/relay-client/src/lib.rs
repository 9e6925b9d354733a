//! relay-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does relay-client do? (for beginners)
//!
//! The client is what a student or teacher runs to take part in the
//! classroom chat.  It:
//!
//! 1. Connects to the relay server over TCP and sends a join request with a
//!    name and a role.
//! 2. Sends packages (usually text) addressed to `all` or to named members.
//! 3. Receives packages, roster updates and, when the connection ends, the
//!    reason it ended (kicked, server stopped, ...).

/// Application layer: received-package store and command parsing.
pub mod application;

/// Infrastructure layer: the network client.
pub mod infrastructure;
