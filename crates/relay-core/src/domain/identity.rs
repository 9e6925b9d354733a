//! Client identity: the name and role a client declares when it joins.
//!
//! An [`Identity`] only exists for the lifetime of one connection.  The
//! server checks it once, at join time, and never persists it.
//!
//! # Name rules
//!
//! - Not empty, at most [`MAX_NAME_LEN`] characters.
//! - ASCII letters, digits and `_` only, so names can be typed in a
//!   comma-separated recipient list without quoting.
//! - Not the reserved recipient keyword [`RECIPIENT_ALL`].
//!
//! Uniqueness is decided on the *folded* name (see [`Identity::key`]):
//! `Alice` and `alice` are the same member.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::admission::RejectReason;

/// Longest accepted member name, in characters.
pub const MAX_NAME_LEN: usize = 32;

/// Recipient keyword addressing every other member.
pub const RECIPIENT_ALL: &str = "all";

/// The role a client declares when it joins.
///
/// Only the standard user role exists today; the enum is the extension point
/// for further roles (a supervising teacher console, bots, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// A standard chat participant.
    User,
}

impl Role {
    /// Every role the server recognises.
    pub const ALL: [Role; 1] = [Role::User];

    /// Canonical wire spelling of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
        }
    }

    /// Whether members with this role appear in the user lists pushed to
    /// every client.
    pub fn is_public(self) -> bool {
        match self {
            Role::User => true,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = RejectReason;

    /// Parses a role case-insensitively (`user`, `User`, `USER`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or(RejectReason::InvalidRole)
    }
}

/// A validated member identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    name: String,
    role: Role,
}

impl Identity {
    /// Builds an identity after checking the name rules.
    ///
    /// # Errors
    ///
    /// [`RejectReason::EmptyName`] for an empty (or all-whitespace) name,
    /// [`RejectReason::InvalidName`] for any other rule violation.
    pub fn new(name: &str, role: Role) -> Result<Self, RejectReason> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            role,
        })
    }

    /// Parses a raw `(name, role)` pair as it arrives in a join request.
    ///
    /// The name is checked before the role, so a request that is wrong in
    /// both ways reports the name problem.
    pub fn parse(name: &str, role: &str) -> Result<Self, RejectReason> {
        validate_name(name)?;
        let role = role.parse::<Role>()?;
        Ok(Self {
            name: name.to_string(),
            role,
        })
    }

    /// The name exactly as the client spelled it.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The case-folded name used for uniqueness and recipient matching.
    pub fn key(&self) -> String {
        name_key(&self.name)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.role)
    }
}

/// Case-folds a member name for comparisons.
pub fn name_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

fn validate_name(name: &str) -> Result<(), RejectReason> {
    if name.trim().is_empty() {
        return Err(RejectReason::EmptyName);
    }
    let well_formed = name.chars().count() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !well_formed || name.eq_ignore_ascii_case(RECIPIENT_ALL) {
        return Err(RejectReason::InvalidName);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_plain_name_and_user_role() {
        let identity = Identity::parse("alice", "user").unwrap();
        assert_eq!(identity.name(), "alice");
        assert_eq!(identity.role(), Role::User);
    }

    #[test]
    fn test_role_parsing_is_case_insensitive() {
        assert_eq!("User".parse::<Role>(), Ok(Role::User));
        assert_eq!("USER".parse::<Role>(), Ok(Role::User));
    }

    #[test]
    fn test_unknown_role_is_rejected_as_invalid_role() {
        assert_eq!(
            Identity::parse("alice", "teacher"),
            Err(RejectReason::InvalidRole)
        );
    }

    #[test]
    fn test_empty_and_blank_names_are_rejected_as_empty() {
        assert_eq!(Identity::parse("", "user"), Err(RejectReason::EmptyName));
        assert_eq!(Identity::parse("   ", "user"), Err(RejectReason::EmptyName));
    }

    #[test]
    fn test_name_with_spaces_or_punctuation_is_invalid() {
        assert_eq!(
            Identity::parse("alice smith", "user"),
            Err(RejectReason::InvalidName)
        );
        assert_eq!(
            Identity::parse("bob,carol", "user"),
            Err(RejectReason::InvalidName)
        );
    }

    #[test]
    fn test_reserved_recipient_keyword_is_not_a_valid_name() {
        assert_eq!(Identity::parse("ALL", "user"), Err(RejectReason::InvalidName));
    }

    #[test]
    fn test_name_longer_than_limit_is_invalid() {
        let long = "a".repeat(MAX_NAME_LEN + 1);
        assert_eq!(Identity::parse(&long, "user"), Err(RejectReason::InvalidName));
        let exact = "a".repeat(MAX_NAME_LEN);
        assert!(Identity::parse(&exact, "user").is_ok());
    }

    #[test]
    fn test_name_is_checked_before_role() {
        assert_eq!(Identity::parse("", "nope"), Err(RejectReason::EmptyName));
    }

    #[test]
    fn test_key_folds_case() {
        let upper = Identity::new("Alice", Role::User).unwrap();
        let lower = Identity::new("alice", Role::User).unwrap();
        assert_eq!(upper.key(), lower.key());
        assert_ne!(upper, lower, "spelling is preserved on the identity itself");
    }
}
