//! Infrastructure layer for the relay server.
//!
//! Contains the OS-facing adapters: TCP sockets and the configuration file.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `relay_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod storage;
