//! Application layer use cases for the relay server.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure business rules, in `relay-core`) and the infrastructure (sockets,
//! files, the terminal).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects to fulfil a goal (e.g., "forward this
//!   package to everyone it is addressed to").
//! - **Depend on abstractions** (the [`registry::Mailbox`] trait) rather than
//!   on sockets, so every rule here is unit-testable without a network.
//! - **Contain no OS calls, no network I/O, no file system access**.
//!
//! # Sub-modules
//!
//! - **`session`**   – The per-connection state machine.
//! - **`registry`**  – Who is an active member; uniqueness, lookup, kick and
//!   broadcast.
//! - **`admission`** – Version, operator toggle and identity checks for a
//!   join request.
//! - **`relay`**     – The relay service tying the three together and
//!   publishing events.

pub mod admission;
pub mod registry;
pub mod relay;
pub mod session;
