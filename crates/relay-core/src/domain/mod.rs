//! Domain entities for the classroom relay.
//!
//! This module contains pure business rules with no infrastructure
//! dependencies: who a client is, what a package is, and when a client may
//! be admitted.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! Clean Architecture organises code into concentric layers.  The innermost
//! layer is called the **domain** (or "entities" layer).  Domain code:
//!
//! - Contains the core business rules of the application.
//! - Has **no** imports from OS APIs, network libraries, or UI frameworks.
//! - Can be compiled and tested on any platform without any external setup.
//!
//! Code in outer layers (server, client, UI) depends on the domain, but the
//! domain never depends on them.

/// Rejection reasons for join requests.
pub mod admission;

/// Member names and roles.
pub mod identity;

/// Packages and recipient sets.
pub mod package;

/// Handshake version compatibility.
pub mod version;
