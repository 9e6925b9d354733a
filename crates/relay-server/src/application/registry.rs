//! Membership registry: who is currently an active member of the relay.
//!
//! The registry is the relay's in-memory database of admitted sessions.  It
//! enforces the one rule that matters most: **at most one active member per
//! name** (compared case-insensitively).
//!
//! # Mailboxes (for beginners)
//!
//! The registry never touches sockets.  Each member carries a [`Mailbox`],
//! a small trait object that can *try* to queue a message for that member and
//! can signal the member's connection to close.  Production code backs it
//! with a bounded Tokio channel; tests back it with a `Vec` that records
//! everything.  Because `try_deliver` never waits, one stalled client can
//! never hold up a broadcast to everyone else.
//!
//! # Single writer
//!
//! All methods take `&self` or `&mut self` and do no I/O.  The relay service
//! owning the registry sits behind one mutex, so a broadcast always sees a
//! frozen member set.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use relay_core::protocol::current_timestamp_us;
use relay_core::protocol::messages::{DisconnectReason, PackageMessage, RelayMessage, UserEntry};
use relay_core::{Identity, Package, Role};
use thiserror::Error;
use uuid::Uuid;

/// Identifies one accepted connection for its whole lifetime.
pub type SessionId = Uuid;

/// Error type for registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Another active member already uses this name.
    #[error("a member named '{0}' is already active")]
    DuplicateIdentity(String),
    /// No active member has this name.
    #[error("no active member named '{0}'")]
    NotFound(String),
}

/// Why a message could not be queued for a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The member's outbound queue is full; it is not keeping up.
    QueueFull,
    /// The member's connection is already gone.
    Closed,
}

/// One outbound frame: a message plus the timestamp to put in its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub message: RelayMessage,
    pub timestamp_us: u64,
}

impl Outbound {
    /// Wraps a server-originated message stamped with the current time.
    pub fn now(message: RelayMessage) -> Self {
        Self {
            message,
            timestamp_us: current_timestamp_us(),
        }
    }
}

/// The registry's only way to reach a member's connection.
pub trait Mailbox: Send + Sync {
    /// Queues `frame` without waiting.
    fn try_deliver(&self, frame: Outbound) -> Result<(), DeliveryError>;

    /// Asks the connection to send `reason` and close.  Must not block and
    /// must be safe to call more than once.
    fn close(&self, reason: DisconnectReason);
}

/// An admitted session.
pub struct Member {
    session: SessionId,
    identity: Identity,
    joined_at: SystemTime,
    join_order: u64,
    mailbox: Arc<dyn Mailbox>,
}

impl Member {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn mailbox(&self) -> &Arc<dyn Mailbox> {
        &self.mailbox
    }

    pub fn info(&self) -> MemberInfo {
        MemberInfo {
            session: self.session,
            name: self.identity.name().to_string(),
            role: self.identity.role(),
            joined_at: self.joined_at,
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("session", &self.session)
            .field("identity", &self.identity)
            .field("joined_at", &self.joined_at)
            .finish_non_exhaustive()
    }
}

/// Plain snapshot of a member for the administrative surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub session: SessionId,
    pub name: String,
    pub role: Role,
    pub joined_at: SystemTime,
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Sessions the package was queued for.
    pub delivered: Vec<SessionId>,
    /// Sessions whose queue refused it; the caller must close them.
    pub failed: Vec<(SessionId, DeliveryError)>,
}

impl DeliveryReport {
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }
}

/// In-memory registry of active members.
#[derive(Default)]
pub struct MembershipRegistry {
    members: HashMap<SessionId, Member>,
    /// Folded name -> session, for uniqueness and lookup.
    by_name: HashMap<String, SessionId>,
    next_join_order: u64,
}

impl MembershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateIdentity`] if the name (case-insensitive) is
    /// already active, or the session was already admitted.
    pub fn admit(
        &mut self,
        session: SessionId,
        identity: Identity,
        mailbox: Arc<dyn Mailbox>,
    ) -> Result<(), RegistryError> {
        let key = identity.key();
        if self.by_name.contains_key(&key) || self.members.contains_key(&session) {
            return Err(RegistryError::DuplicateIdentity(identity.name().to_string()));
        }
        let join_order = self.next_join_order;
        self.next_join_order += 1;
        self.by_name.insert(key, session);
        self.members.insert(
            session,
            Member {
                session,
                identity,
                joined_at: SystemTime::now(),
                join_order,
                mailbox,
            },
        );
        Ok(())
    }

    /// Removes a member.  Idempotent: returns `None` if it was not there.
    pub fn remove(&mut self, session: SessionId) -> Option<Member> {
        let member = self.members.remove(&session)?;
        self.by_name.remove(&member.identity.key());
        Some(member)
    }

    /// Finds the active member with this name (case-insensitive).
    pub fn lookup(&self, name: &str) -> Option<&Member> {
        self.by_name
            .get(&relay_core::domain::identity::name_key(name))
            .and_then(|session| self.members.get(session))
    }

    pub fn get(&self, session: SessionId) -> Option<&Member> {
        self.members.get(&session)
    }

    /// Removes the named member and tells its connection to close.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if no active member has this name; the
    /// registry is left unchanged.
    pub fn kick(&mut self, name: &str) -> Result<Member, RegistryError> {
        let session = self
            .lookup(name)
            .map(Member::session)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let member = self
            .remove(session)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        member.mailbox.close(DisconnectReason::Kicked);
        Ok(member)
    }

    /// Queues `package` for every addressed member.
    ///
    /// The member whose session is `sender` is skipped unless
    /// `echo_to_sender` is set.  Each delivery is attempted independently;
    /// failures are reported, never propagated.
    pub fn broadcast(
        &self,
        package: &Package,
        sender: SessionId,
        echo_to_sender: bool,
    ) -> DeliveryReport {
        let frame = Outbound {
            message: RelayMessage::Package(PackageMessage {
                sender: package.sender().name().to_string(),
                recipients: package.recipients().clone(),
                content_type: package.content_type().to_string(),
                payload: package.payload().to_vec(),
            }),
            timestamp_us: package.timestamp_us(),
        };

        let mut report = DeliveryReport::default();
        for member in self.members.values() {
            if member.session == sender && !echo_to_sender {
                continue;
            }
            if !package.recipients().includes(&member.identity.key()) {
                continue;
            }
            match member.mailbox.try_deliver(frame.clone()) {
                Ok(()) => report.delivered.push(member.session),
                Err(e) => report.failed.push((member.session, e)),
            }
        }
        report
    }

    /// Queues `message` for every member; returns the sessions that refused it.
    pub fn send_to_all(&self, message: &RelayMessage) -> Vec<(SessionId, DeliveryError)> {
        self.members
            .values()
            .filter_map(|member| {
                member
                    .mailbox
                    .try_deliver(Outbound::now(message.clone()))
                    .err()
                    .map(|e| (member.session, e))
            })
            .collect()
    }

    /// Members in join order.
    pub fn members(&self) -> Vec<MemberInfo> {
        let mut members: Vec<&Member> = self.members.values().collect();
        members.sort_by_key(|m| m.join_order);
        members.into_iter().map(Member::info).collect()
    }

    /// The roster pushed to clients: public roles only, in join order.
    pub fn user_list(&self) -> Vec<UserEntry> {
        self.members()
            .into_iter()
            .filter(|m| m.role.is_public())
            .map(|m| UserEntry {
                name: m.name,
                role: m.role,
            })
            .collect()
    }

    /// Removes every member, returning them in join order.
    pub fn drain(&mut self) -> Vec<Member> {
        self.by_name.clear();
        let mut members: Vec<Member> = self.members.drain().map(|(_, m)| m).collect();
        members.sort_by_key(|m| m.join_order);
        members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// ── Test support ──────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::testing::RecordingMailbox;
    use super::*;
    use relay_core::Recipients;

    fn identity(name: &str) -> Identity {
        Identity::new(name, Role::User).unwrap()
    }

    fn admit(registry: &mut MembershipRegistry, name: &str) -> (SessionId, Arc<RecordingMailbox>) {
        let session = Uuid::new_v4();
        let mailbox = RecordingMailbox::new();
        registry
            .admit(session, identity(name), mailbox.clone())
            .expect("admit");
        (session, mailbox)
    }

    fn package(from: &str, recipients: Recipients) -> Package {
        Package::new(identity(from), recipients, "text/plain", b"hi".to_vec(), 42)
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = MembershipRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.members().is_empty());
    }

    #[test]
    fn test_admit_rejects_duplicate_name_case_insensitively() {
        // Arrange
        let mut registry = MembershipRegistry::new();
        admit(&mut registry, "alice");

        // Act
        let result = registry.admit(Uuid::new_v4(), identity("ALICE"), RecordingMailbox::new());

        // Assert
        assert_eq!(
            result,
            Err(RegistryError::DuplicateIdentity("ALICE".to_string()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_name_is_free_again_after_remove() {
        let mut registry = MembershipRegistry::new();
        let (alice, _) = admit(&mut registry, "alice");
        assert!(registry.remove(alice).is_some());
        assert!(registry
            .admit(Uuid::new_v4(), identity("alice"), RecordingMailbox::new())
            .is_ok());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = MembershipRegistry::new();
        let (alice, _) = admit(&mut registry, "alice");
        assert!(registry.remove(alice).is_some());
        assert!(registry.remove(alice).is_none());
        assert!(registry.remove(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_no_two_members_share_a_name_over_random_admits_and_removes() {
        // Arrange: a deterministic pseudo-random walk over a few names
        let mut registry = MembershipRegistry::new();
        let names = ["alice", "Alice", "bob", "BOB", "carol"];
        let mut sessions: Vec<SessionId> = Vec::new();
        let mut state: u32 = 7;

        // Act
        for _ in 0..500 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let pick = (state >> 16) as usize;
            if pick % 3 == 0 && !sessions.is_empty() {
                let victim = sessions.remove(pick % sessions.len());
                registry.remove(victim);
            } else {
                let session = Uuid::new_v4();
                let name = names[pick % names.len()];
                if registry
                    .admit(session, identity(name), RecordingMailbox::new())
                    .is_ok()
                {
                    sessions.push(session);
                }
            }

            // Assert: folded names are unique at every step
            let mut keys: Vec<String> = registry
                .members()
                .iter()
                .map(|m| m.name.to_ascii_lowercase())
                .collect();
            let before = keys.len();
            keys.sort();
            keys.dedup();
            assert_eq!(keys.len(), before);
        }
    }

    #[test]
    fn test_broadcast_to_all_skips_sender() {
        // Arrange
        let mut registry = MembershipRegistry::new();
        let (alice, alice_box) = admit(&mut registry, "alice");
        let (bob, bob_box) = admit(&mut registry, "bob");
        let (carol, carol_box) = admit(&mut registry, "carol");

        // Act
        let report = registry.broadcast(&package("alice", Recipients::All), alice, false);

        // Assert
        let mut delivered = report.delivered.clone();
        delivered.sort();
        let mut expected = vec![bob, carol];
        expected.sort();
        assert_eq!(delivered, expected);
        assert!(report.failed.is_empty());
        assert!(alice_box.packages().is_empty());
        assert_eq!(bob_box.packages()[0].sender, "alice");
        assert_eq!(carol_box.packages()[0].payload, b"hi");
        assert_eq!(bob_box.frames.lock().unwrap()[0].timestamp_us, 42);
    }

    #[test]
    fn test_broadcast_with_echo_includes_sender() {
        let mut registry = MembershipRegistry::new();
        let (alice, alice_box) = admit(&mut registry, "alice");
        let report = registry.broadcast(&package("alice", Recipients::All), alice, true);
        assert_eq!(report.delivered, vec![alice]);
        assert_eq!(alice_box.packages().len(), 1);
    }

    #[test]
    fn test_broadcast_to_names_skips_unknown_and_unaddressed() {
        // Arrange
        let mut registry = MembershipRegistry::new();
        let (alice, _) = admit(&mut registry, "alice");
        let (_, bob_box) = admit(&mut registry, "bob");
        let (_, carol_box) = admit(&mut registry, "carol");
        let recipients = Recipients::Names(vec!["BOB".to_string(), "dave".to_string()]);

        // Act
        let report = registry.broadcast(&package("alice", recipients), alice, false);

        // Assert
        assert_eq!(report.delivered_count(), 1);
        assert_eq!(bob_box.packages().len(), 1);
        assert!(carol_box.packages().is_empty());
    }

    #[test]
    fn test_explicitly_naming_self_does_not_echo_by_default() {
        let mut registry = MembershipRegistry::new();
        let (alice, alice_box) = admit(&mut registry, "alice");
        let recipients = Recipients::Names(vec!["alice".to_string()]);
        let report = registry.broadcast(&package("alice", recipients), alice, false);
        assert_eq!(report.delivered_count(), 0);
        assert!(alice_box.packages().is_empty());
    }

    #[test]
    fn test_failed_recipient_does_not_stop_others() {
        // Arrange
        let mut registry = MembershipRegistry::new();
        let (alice, _) = admit(&mut registry, "alice");
        let stalled = Uuid::new_v4();
        registry
            .admit(
                stalled,
                identity("bob"),
                RecordingMailbox::refusing(DeliveryError::QueueFull),
            )
            .unwrap();
        let (carol, carol_box) = admit(&mut registry, "carol");

        // Act
        let report = registry.broadcast(&package("alice", Recipients::All), alice, false);

        // Assert
        assert_eq!(report.delivered, vec![carol]);
        assert_eq!(report.failed, vec![(stalled, DeliveryError::QueueFull)]);
        assert_eq!(carol_box.packages().len(), 1);
    }

    #[test]
    fn test_kick_removes_and_closes_member() {
        // Arrange
        let mut registry = MembershipRegistry::new();
        let (_, bob_box) = admit(&mut registry, "bob");

        // Act
        let kicked = registry.kick("Bob").unwrap();

        // Assert
        assert_eq!(kicked.identity().name(), "bob");
        assert_eq!(bob_box.closed_with(), vec![DisconnectReason::Kicked]);
        assert!(registry.lookup("bob").is_none());
    }

    #[test]
    fn test_kick_unknown_name_is_not_found_and_changes_nothing() {
        let mut registry = MembershipRegistry::new();
        admit(&mut registry, "alice");
        let before = registry.members();

        let result = registry.kick("bob");

        assert_eq!(result.unwrap_err(), RegistryError::NotFound("bob".to_string()));
        assert_eq!(registry.members(), before);
    }

    #[test]
    fn test_members_are_listed_in_join_order() {
        let mut registry = MembershipRegistry::new();
        for name in ["carol", "alice", "bob"] {
            admit(&mut registry, name);
        }
        let names: Vec<String> = registry.user_list().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["carol", "alice", "bob"]);
    }

    #[test]
    fn test_drain_empties_registry_and_frees_names() {
        let mut registry = MembershipRegistry::new();
        admit(&mut registry, "alice");
        admit(&mut registry, "bob");
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.lookup("alice").is_none());
    }
}
