//! Storage infrastructure: configuration file loading.
//!
//! The relay keeps no persistent state; the only file it reads is its own
//! TOML configuration.  Keeping that here means the rest of the server only
//! ever sees a typed [`config::AppConfig`].

pub mod config;
