//! Application version exchanged during the join handshake.
//!
//! Clients and servers are compatible when their major *and* minor versions
//! match.  Patch releases only fix bugs and never change the protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Semantic version of the relay protocol implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

/// The version this build speaks.
pub const CURRENT_VERSION: AppVersion = AppVersion::new(1, 1, 0);

impl AppVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Returns `true` if a peer running `other` can talk to us.
    pub fn is_compatible_with(&self, other: &AppVersion) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_difference_is_compatible() {
        assert!(AppVersion::new(1, 1, 0).is_compatible_with(&AppVersion::new(1, 1, 7)));
    }

    #[test]
    fn test_minor_or_major_difference_is_incompatible() {
        let ours = AppVersion::new(1, 1, 0);
        assert!(!ours.is_compatible_with(&AppVersion::new(1, 2, 0)));
        assert!(!ours.is_compatible_with(&AppVersion::new(2, 1, 0)));
    }

    #[test]
    fn test_display_is_dotted() {
        assert_eq!(AppVersion::new(1, 2, 3).to_string(), "1.2.3");
    }
}
