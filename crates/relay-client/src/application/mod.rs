//! Application layer for the client.
//!
//! - **`package_store`** – Keeps received packages and answers "what did
//!   alice send?" or "what was addressed to me?" queries.
//! - **`command`** – Turns a line typed into the terminal into a
//!   [`command::ClientCommand`].
//!
//! Neither module touches the network; the terminal in `main.rs` glues them
//! to the [`crate::infrastructure::network::RelayClient`].

pub mod command;
pub mod package_store;
