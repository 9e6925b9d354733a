//! Reasons a join request can be refused.
//!
//! The same enum travels on the wire (as a one-byte code inside
//! `JoinResponse`) and is surfaced to users, so every variant has a
//! human-readable `Display`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the server refused to admit a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[repr(u8)]
pub enum RejectReason {
    /// Another active member already uses this name (case-insensitive).
    #[error("the name is already taken by another member")]
    NameTaken = 0x01,
    /// The name was empty.
    #[error("the name must not be empty")]
    EmptyName = 0x02,
    /// The name breaks the naming rules (characters, length, reserved word).
    #[error("the name may only contain letters, digits and '_' (at most 32)")]
    InvalidName = 0x03,
    /// The declared role is not one the server knows.
    #[error("the requested role is not recognised by the server")]
    InvalidRole = 0x04,
    /// The operator has switched off admission of new clients.
    #[error("the server is not accepting new clients")]
    ServerNotAccepting = 0x05,
    /// Client and server speak incompatible protocol versions.
    #[error("the client version is incompatible with the server")]
    IncompatibleVersion = 0x06,
}

impl RejectReason {
    /// The wire code of this reason.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for RejectReason {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(RejectReason::NameTaken),
            0x02 => Ok(RejectReason::EmptyName),
            0x03 => Ok(RejectReason::InvalidName),
            0x04 => Ok(RejectReason::InvalidRole),
            0x05 => Ok(RejectReason::ServerNotAccepting),
            0x06 => Ok(RejectReason::IncompatibleVersion),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_reason_survives_its_wire_code() {
        let all = [
            RejectReason::NameTaken,
            RejectReason::EmptyName,
            RejectReason::InvalidName,
            RejectReason::InvalidRole,
            RejectReason::ServerNotAccepting,
            RejectReason::IncompatibleVersion,
        ];
        for reason in all {
            assert_eq!(RejectReason::try_from(reason.code()), Ok(reason));
        }
    }

    #[test]
    fn test_zero_is_not_a_reason() {
        // 0x00 is the "accepted" placeholder in JoinResponse.
        assert!(RejectReason::try_from(0x00).is_err());
    }
}
