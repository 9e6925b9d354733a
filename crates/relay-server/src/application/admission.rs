//! Admission policy: the checks a join request must pass before the registry
//! is even consulted.
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! 1. Version compatibility (`IncompatibleVersion`).
//! 2. The operator toggle (`ServerNotAccepting`).  This comes before any
//!    identity check so a closed server answers the same way to everyone.
//! 3. Name and role rules (`EmptyName`, `InvalidName`, `InvalidRole`).
//!
//! Name *uniqueness* is not decided here; only the registry can answer it
//! atomically.

use relay_core::protocol::messages::JoinMessage;
use relay_core::{AppVersion, Identity, RejectReason, CURRENT_VERSION};

/// Server-side admission settings, mutable by the operator at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionPolicy {
    accepting_new_clients: bool,
    server_version: AppVersion,
}

impl AdmissionPolicy {
    pub fn new(accepting_new_clients: bool) -> Self {
        Self {
            accepting_new_clients,
            server_version: CURRENT_VERSION,
        }
    }

    /// Overrides the version the server claims (used by tests).
    pub fn with_server_version(mut self, version: AppVersion) -> Self {
        self.server_version = version;
        self
    }

    pub fn accepting_new_clients(&self) -> bool {
        self.accepting_new_clients
    }

    /// Only affects handshakes that have not been evaluated yet.
    pub fn set_accepting_new_clients(&mut self, accepting: bool) {
        self.accepting_new_clients = accepting;
    }

    pub fn server_version(&self) -> AppVersion {
        self.server_version
    }

    /// Validates `join` and returns the identity to admit.
    ///
    /// # Errors
    ///
    /// The first [`RejectReason`] that applies, in the order documented on
    /// this module.
    pub fn evaluate(&self, join: &JoinMessage) -> Result<Identity, RejectReason> {
        if !self.server_version.is_compatible_with(&join.version) {
            return Err(RejectReason::IncompatibleVersion);
        }
        if !self.accepting_new_clients {
            return Err(RejectReason::ServerNotAccepting);
        }
        Identity::parse(&join.name, &join.role)
    }
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::new(true)
    }
}
