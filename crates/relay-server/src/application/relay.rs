//! RelayService: the use cases of the relay in one place.
//!
//! The service owns the [`MembershipRegistry`], the [`AdmissionPolicy`] and
//! the event sender.  It does no I/O: it decides, queues into mailboxes and
//! publishes [`RelayEvent`]s.  The network layer wraps one instance in a
//! `tokio::sync::Mutex` and calls it from every connection task, which makes
//! the service the single serialization point for membership changes.
//!
//! # Event stream (for beginners)
//!
//! Anything that wants to follow the relay (the operator console, tests, a
//! future GUI) calls [`RelayService::subscribe`] and receives a copy of every
//! event on a `tokio::sync::broadcast` channel.  Nobody holds references into
//! the service's internals; they issue commands and watch events.

use std::net::SocketAddr;
use std::sync::Arc;

use relay_core::domain::package::is_valid_content_type;
use relay_core::protocol::messages::{
    DisconnectReason, JoinMessage, JoinResponseMessage, PackageMessage, RelayMessage,
    MAX_PAYLOAD_LEN,
};
use relay_core::{Identity, Package, RejectReason};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::application::admission::AdmissionPolicy;
use crate::application::registry::{
    DeliveryReport, Mailbox, MemberInfo, MembershipRegistry, Outbound, RegistryError, SessionId,
};
use crate::application::session::LeaveCause;

/// Capacity of the event channel; slow subscribers lag rather than block.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Error type for relay operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// No active member has this name.
    #[error("no active member named '{0}'")]
    NotFound(String),
    /// The session is not (or no longer) an active member.
    #[error("session {0} is not an active member")]
    UnknownSession(SessionId),
    /// The package was refused; the sender stays connected.
    #[error("invalid package: {0}")]
    InvalidPackage(String),
    /// The relay has been shut down.
    #[error("the relay has been shut down")]
    ServerStopped,
}

/// Something observable happened in the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    ClientJoined {
        session: SessionId,
        identity: Identity,
        peer: SocketAddr,
    },
    ClientLeft {
        session: SessionId,
        identity: Identity,
        cause: LeaveCause,
    },
    ClientRejected {
        peer: SocketAddr,
        name: String,
        reason: RejectReason,
    },
    PackageRelayed {
        sender: Identity,
        content_type: String,
        recipients: usize,
    },
}

/// Runtime options that are not part of admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    pub accept_new_clients: bool,
    pub echo_to_sender: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            accept_new_clients: true,
            echo_to_sender: false,
        }
    }
}

/// The relay's application core.
pub struct RelayService {
    registry: MembershipRegistry,
    policy: AdmissionPolicy,
    echo_to_sender: bool,
    events: broadcast::Sender<RelayEvent>,
    stopped: bool,
}

impl RelayService {
    pub fn new(options: RelayOptions) -> Self {
        Self::with_policy(AdmissionPolicy::new(options.accept_new_clients), options.echo_to_sender)
    }

    pub fn with_policy(policy: AdmissionPolicy, echo_to_sender: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry: MembershipRegistry::new(),
            policy,
            echo_to_sender,
            events,
            stopped: false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// A sender clone, so holders can subscribe without taking the lock.
    pub fn event_sender(&self) -> broadcast::Sender<RelayEvent> {
        self.events.clone()
    }

    // ── Join / leave ──────────────────────────────────────────────────────────

    /// Evaluates a join request and, if it passes, admits the session.
    ///
    /// On success the accepted `JoinResponse` is queued into `mailbox`
    /// *before* the member becomes visible, so the client always sees its
    /// response ahead of any user list or package.
    ///
    /// # Errors
    ///
    /// The [`RejectReason`] to send back.  Nothing is queued into `mailbox`
    /// on rejection; the caller answers and closes.
    pub fn join(
        &mut self,
        session: SessionId,
        peer: SocketAddr,
        request: &JoinMessage,
        mailbox: Arc<dyn Mailbox>,
    ) -> Result<Identity, RejectReason> {
        let outcome = self.try_admit(session, request, mailbox);
        match &outcome {
            Ok(identity) => {
                info!(%peer, member = %identity, "client joined");
                self.emit(RelayEvent::ClientJoined {
                    session,
                    identity: identity.clone(),
                    peer,
                });
                self.publish_user_list();
            }
            Err(reason) => {
                info!(%peer, name = %request.name, %reason, "join rejected");
                self.emit(RelayEvent::ClientRejected {
                    peer,
                    name: request.name.clone(),
                    reason: *reason,
                });
            }
        }
        outcome
    }

    fn try_admit(
        &mut self,
        session: SessionId,
        request: &JoinMessage,
        mailbox: Arc<dyn Mailbox>,
    ) -> Result<Identity, RejectReason> {
        if self.stopped {
            return Err(RejectReason::ServerNotAccepting);
        }
        let identity = self.policy.evaluate(request)?;
        if self.registry.lookup(identity.name()).is_some() {
            return Err(RejectReason::NameTaken);
        }
        mailbox
            .try_deliver(Outbound::now(RelayMessage::JoinResponse(
                JoinResponseMessage::accepted(self.policy.server_version()),
            )))
            .map_err(|_| RejectReason::ServerNotAccepting)?;
        self.registry
            .admit(session, identity.clone(), mailbox)
            .map_err(|e| match e {
                RegistryError::DuplicateIdentity(_) | RegistryError::NotFound(_) => {
                    RejectReason::NameTaken
                }
            })?;
        Ok(identity)
    }

    /// Removes a member that is leaving on its own account.  Idempotent:
    /// returns `None` if the session was already gone (kicked, evicted).
    pub fn leave(&mut self, session: SessionId, cause: LeaveCause) -> Option<Identity> {
        let identity = self.evict(session, cause)?;
        self.publish_user_list();
        Some(identity)
    }

    // ── Packages ──────────────────────────────────────────────────────────────

    /// Relays a package received from `session`.
    ///
    /// The sender field is overwritten with the session's identity.  Members
    /// whose queue refuses the package are closed as unresponsive; the rest
    /// still get it.
    ///
    /// # Errors
    ///
    /// - [`RelayError::ServerStopped`] after shutdown.
    /// - [`RelayError::UnknownSession`] if the session is not a member.
    /// - [`RelayError::InvalidPackage`] for a bad content type, or a package
    ///   that no longer fits in a frame once the sender is stamped.
    pub fn submit(
        &mut self,
        session: SessionId,
        message: PackageMessage,
        timestamp_us: u64,
    ) -> Result<DeliveryReport, RelayError> {
        if self.stopped {
            return Err(RelayError::ServerStopped);
        }
        let sender = self
            .registry
            .get(session)
            .map(|m| m.identity().clone())
            .ok_or(RelayError::UnknownSession(session))?;
        if !is_valid_content_type(&message.content_type) {
            return Err(RelayError::InvalidPackage(format!(
                "content type '{}' is not a valid token",
                message.content_type
            )));
        }

        let stamped = PackageMessage {
            sender: sender.name().to_string(),
            ..message
        };
        if stamped.encoded_len() > MAX_PAYLOAD_LEN {
            return Err(RelayError::InvalidPackage(format!(
                "package is {} bytes once stamped with the sender; the limit is {MAX_PAYLOAD_LEN}",
                stamped.encoded_len()
            )));
        }

        let package = Package::new(
            sender.clone(),
            stamped.recipients,
            stamped.content_type,
            stamped.payload,
            timestamp_us,
        );
        let report = self.registry.broadcast(&package, session, self.echo_to_sender);
        debug!(
            member = %sender,
            recipients = %package.recipients(),
            delivered = report.delivered_count(),
            "package relayed"
        );

        if !report.failed.is_empty() {
            for (stalled, error) in &report.failed {
                warn!(session = %stalled, ?error, "recipient refused package; closing it");
                self.evict(*stalled, LeaveCause::Unresponsive);
            }
            self.publish_user_list();
        }

        self.emit(RelayEvent::PackageRelayed {
            sender,
            content_type: package.content_type().to_string(),
            recipients: report.delivered_count(),
        });
        Ok(report)
    }

    // ── Administration ────────────────────────────────────────────────────────

    /// Forcibly disconnects the named member.
    ///
    /// # Errors
    ///
    /// [`RelayError::NotFound`] if nobody by that name is active,
    /// [`RelayError::ServerStopped`] after shutdown.
    pub fn kick(&mut self, name: &str) -> Result<Identity, RelayError> {
        if self.stopped {
            return Err(RelayError::ServerStopped);
        }
        let member = self.registry.kick(name).map_err(|e| match e {
            RegistryError::NotFound(n) | RegistryError::DuplicateIdentity(n) => {
                RelayError::NotFound(n)
            }
        })?;
        let identity = member.identity().clone();
        info!(member = %identity, "member kicked");
        self.emit(RelayEvent::ClientLeft {
            session: member.session(),
            identity: identity.clone(),
            cause: LeaveCause::Kicked,
        });
        self.publish_user_list();
        Ok(identity)
    }

    pub fn set_accepting_new_clients(&mut self, accepting: bool) -> Result<(), RelayError> {
        if self.stopped {
            return Err(RelayError::ServerStopped);
        }
        self.policy.set_accepting_new_clients(accepting);
        info!(accepting, "admission policy changed");
        Ok(())
    }

    pub fn is_accepting_new_clients(&self) -> bool {
        !self.stopped && self.policy.accepting_new_clients()
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.registry.members()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Closes every member with `ServerShutdown` and refuses all further
    /// joins.  Returns how many members were closed.  Terminal.
    pub fn shutdown(&mut self) -> usize {
        if self.stopped {
            return 0;
        }
        self.stopped = true;
        let members = self.registry.drain();
        for member in &members {
            member.mailbox().close(DisconnectReason::ServerShutdown);
            self.emit(RelayEvent::ClientLeft {
                session: member.session(),
                identity: member.identity().clone(),
                cause: LeaveCause::ServerShutdown,
            });
        }
        info!(closed = members.len(), "relay stopped");
        members.len()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Removes a member, closes it if the server is the one ending it, and
    /// announces the departure.  Does not publish a user list.
    fn evict(&mut self, session: SessionId, cause: LeaveCause) -> Option<Identity> {
        let member = self.registry.remove(session)?;
        if let Some(reason) = cause.disconnect_reason() {
            member.mailbox().close(reason);
        }
        let identity = member.identity().clone();
        info!(member = %identity, %cause, "client left");
        self.emit(RelayEvent::ClientLeft {
            session,
            identity: identity.clone(),
            cause,
        });
        Some(identity)
    }

    /// Pushes the current roster to every member.  Members that cannot take
    /// it are evicted and the roster is pushed again without them.
    fn publish_user_list(&mut self) {
        loop {
            let roster = RelayMessage::UserList(self.registry.user_list());
            let failed = self.registry.send_to_all(&roster);
            if failed.is_empty() {
                break;
            }
            for (stalled, _) in failed {
                self.evict(stalled, LeaveCause::Unresponsive);
            }
        }
    }

    fn emit(&self, event: RelayEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for RelayService {
    fn default() -> Self {
        Self::new(RelayOptions::default())
    }
}
