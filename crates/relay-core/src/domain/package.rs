//! Packages: one unit of user content plus its routing metadata.
//!
//! A [`Package`] is immutable once built.  Its recipients are *names*, not
//! sessions: the server resolves them against whoever is active at delivery
//! time, so a member that left in the meantime is simply skipped.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::identity::{name_key, Identity, RECIPIENT_ALL};

/// Content type used when the sender does not specify one.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Who a package is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipients {
    /// Every active member except the sender.
    All,
    /// Only the named members (matched case-insensitively).
    Names(Vec<String>),
}

impl Recipients {
    /// Parses the textual form used by the terminal client: `all` or a
    /// comma-separated list of names.  Empty entries are dropped; a list
    /// that ends up empty, or that mentions `all` anywhere, means everyone.
    pub fn parse(text: &str) -> Self {
        let names: Vec<String> = text
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() || names.iter().any(|n| n.eq_ignore_ascii_case(RECIPIENT_ALL)) {
            Recipients::All
        } else {
            Recipients::Names(names)
        }
    }

    /// Returns `true` if a member whose folded name is `member_key` is
    /// addressed.  Sender exclusion is the caller's policy, not decided here.
    pub fn includes(&self, member_key: &str) -> bool {
        match self {
            Recipients::All => true,
            Recipients::Names(names) => names.iter().any(|n| name_key(n) == member_key),
        }
    }
}

impl fmt::Display for Recipients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipients::All => f.write_str(RECIPIENT_ALL),
            Recipients::Names(names) => f.write_str(&names.join(",")),
        }
    }
}

/// A package as seen by the relay after the sender has been stamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    sender: Identity,
    recipients: Recipients,
    content_type: String,
    payload: Vec<u8>,
    timestamp_us: u64,
}

impl Package {
    pub fn new(
        sender: Identity,
        recipients: Recipients,
        content_type: impl Into<String>,
        payload: Vec<u8>,
        timestamp_us: u64,
    ) -> Self {
        Self {
            sender,
            recipients,
            content_type: content_type.into(),
            payload,
            timestamp_us,
        }
    }

    pub fn sender(&self) -> &Identity {
        &self.sender
    }

    pub fn recipients(&self) -> &Recipients {
        &self.recipients
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Microseconds since the Unix epoch at which the sender produced it.
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }
}

/// Checks a content-type token: non-empty, `[A-Za-z0-9/._-]+`.
pub fn is_valid_content_type(content_type: &str) -> bool {
    !content_type.is_empty()
        && content_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'))
}
