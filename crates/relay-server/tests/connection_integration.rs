//! Integration tests for the relay server over real TCP sockets.
//!
//! Each test starts a [`RelayServer`] on an ephemeral localhost port and
//! talks to it with raw frames, so the wire behaviour is what is under test.

use std::net::SocketAddr;
use std::time::Duration;

use relay_core::protocol::messages::{
    DisconnectReason, ErrorMessage, JoinMessage, PackageMessage, ProtocolErrorCode, UserEntry,
    MAX_PAYLOAD_LEN,
};
use relay_core::protocol::{write_message, FrameReader, SequenceCounter};
use relay_core::{AppVersion, Recipients, RejectReason, RelayMessage, CURRENT_VERSION};
use relay_server::application::relay::RelayEvent;
use relay_server::infrastructure::network::connection::SessionLimits;
use relay_server::infrastructure::network::{RelayServer, ServerSettings};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn start_server(limits: SessionLimits) -> RelayServer {
    RelayServer::start(ServerSettings {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        limits,
        ..ServerSettings::default()
    })
    .await
    .expect("server must start")
}

struct RawClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    sequence: SequenceCounter,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, writer) = stream.into_split();
        Self {
            reader: FrameReader::new(read_half),
            writer,
            sequence: SequenceCounter::new(),
        }
    }

    /// Connects and joins, asserting the join is accepted.
    async fn joined(addr: SocketAddr, name: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(&join(name)).await;
        match client.recv().await {
            RelayMessage::JoinResponse(response) => {
                assert!(response.is_accepted(), "{name} was rejected: {response:?}")
            }
            other => panic!("expected JoinResponse, got {other:?}"),
        }
        client
    }

    async fn send(&mut self, message: &RelayMessage) {
        write_message(&mut self.writer, message, &self.sequence)
            .await
            .expect("write");
    }

    async fn recv(&mut self) -> RelayMessage {
        timeout(WAIT, self.reader.read_message())
            .await
            .expect("timed out waiting for a frame")
            .expect("read failed")
            .expect("connection closed unexpectedly")
    }

    /// Next frame that is not a roster update.
    async fn recv_skipping_rosters(&mut self) -> RelayMessage {
        loop {
            match self.recv().await {
                RelayMessage::UserList(_) => continue,
                other => return other,
            }
        }
    }

    /// Waits for a roster listing exactly `names`.
    async fn wait_for_roster(&mut self, names: &[&str]) -> Vec<UserEntry> {
        loop {
            if let RelayMessage::UserList(users) = self.recv().await {
                let listed: Vec<&str> = users.iter().map(|u| u.name.as_str()).collect();
                if listed == names {
                    return users;
                }
            }
        }
    }

    /// Asserts the server closes the connection without further frames
    /// other than rosters.
    async fn expect_closed(&mut self) {
        loop {
            let next = timeout(WAIT, self.reader.read_message())
                .await
                .expect("timed out waiting for close");
            match next {
                Ok(None) | Err(_) => return,
                Ok(Some(RelayMessage::UserList(_))) => continue,
                Ok(Some(other)) => panic!("expected close, got {other:?}"),
            }
        }
    }
}

fn join(name: &str) -> RelayMessage {
    RelayMessage::Join(JoinMessage {
        version: CURRENT_VERSION,
        name: name.to_string(),
        role: "user".to_string(),
    })
}

/// A package from `claimed_sender` padded so it encodes to exactly the
/// frame limit.
fn full_size_package(claimed_sender: &str) -> PackageMessage {
    let mut package = PackageMessage {
        sender: claimed_sender.to_string(),
        recipients: Recipients::All,
        content_type: "application/octet-stream".to_string(),
        payload: Vec::new(),
    };
    package.payload = vec![0x5a; MAX_PAYLOAD_LEN - package.encoded_len()];
    package
}

fn text(claimed_sender: &str, to: Recipients, body: &str) -> RelayMessage {
    RelayMessage::Package(PackageMessage {
        sender: claimed_sender.to_string(),
        recipients: to,
        content_type: "text/plain".to_string(),
        payload: body.as_bytes().to_vec(),
    })
}

// ── Admission ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_join_is_answered_then_roster_follows() {
    // Arrange
    let server = start_server(SessionLimits::default()).await;

    // Act
    let mut alice = RawClient::joined(server.local_addr(), "alice").await;

    // Assert
    let roster = alice.wait_for_roster(&["alice"]).await;
    assert_eq!(roster[0].role.as_str(), "user");
    assert_eq!(server.members().await.len(), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn test_name_in_use_is_rejected_case_insensitively() {
    let server = start_server(SessionLimits::default()).await;
    let _alice = RawClient::joined(server.local_addr(), "alice").await;

    let mut imposter = RawClient::connect(server.local_addr()).await;
    imposter.send(&join("ALICE")).await;

    match imposter.recv().await {
        RelayMessage::JoinResponse(response) => {
            assert_eq!(response.rejection, Some(RejectReason::NameTaken));
        }
        other => panic!("expected JoinResponse, got {other:?}"),
    }
    imposter.expect_closed().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_simultaneous_joins_with_one_name_admit_exactly_one() {
    let server = start_server(SessionLimits::default()).await;
    let mut first = RawClient::connect(server.local_addr()).await;
    let mut second = RawClient::connect(server.local_addr()).await;

    // Act: both requests are on the wire before either is answered.
    first.send(&join("sam")).await;
    second.send(&join("sam")).await;
    let answers = [first.recv().await, second.recv().await];

    // Assert
    let accepted = answers
        .iter()
        .filter(|m| matches!(m, RelayMessage::JoinResponse(r) if r.is_accepted()))
        .count();
    let name_taken = answers
        .iter()
        .filter(|m| {
            matches!(m, RelayMessage::JoinResponse(r) if r.rejection == Some(RejectReason::NameTaken))
        })
        .count();
    assert_eq!((accepted, name_taken), (1, 1));
    assert_eq!(server.members().await.len(), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn test_incompatible_version_is_rejected() {
    let server = start_server(SessionLimits::default()).await;
    let mut client = RawClient::connect(server.local_addr()).await;

    client
        .send(&RelayMessage::Join(JoinMessage {
            version: AppVersion::new(CURRENT_VERSION.major + 1, 0, 0),
            name: "alice".to_string(),
            role: "user".to_string(),
        }))
        .await;

    match client.recv().await {
        RelayMessage::JoinResponse(response) => {
            assert_eq!(response.rejection, Some(RejectReason::IncompatibleVersion));
        }
        other => panic!("expected JoinResponse, got {other:?}"),
    }
    server.shutdown().await;
}

#[tokio::test]
async fn test_admission_toggle_refuses_new_clients_only() {
    // Arrange
    let server = start_server(SessionLimits::default()).await;
    let mut alice = RawClient::joined(server.local_addr(), "alice").await;
    alice.wait_for_roster(&["alice"]).await;

    // Act
    server.set_accepting_new_clients(false).await.unwrap();
    let mut bob = RawClient::connect(server.local_addr()).await;
    bob.send(&join("bob")).await;

    // Assert
    match bob.recv().await {
        RelayMessage::JoinResponse(response) => {
            assert_eq!(response.rejection, Some(RejectReason::ServerNotAccepting));
        }
        other => panic!("expected JoinResponse, got {other:?}"),
    }
    alice.send(&RelayMessage::Ping(5)).await;
    assert_eq!(alice.recv_skipping_rosters().await, RelayMessage::Pong(5));
    assert!(!server.is_accepting_new_clients().await);
    server.shutdown().await;
}

// ── Relaying ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_package_reaches_only_named_recipient_with_true_sender() {
    // Arrange
    let server = start_server(SessionLimits::default()).await;
    let addr = server.local_addr();
    let mut alice = RawClient::joined(addr, "alice").await;
    let mut bob = RawClient::joined(addr, "bob").await;
    let mut carol = RawClient::joined(addr, "carol").await;
    alice.wait_for_roster(&["alice", "bob", "carol"]).await;

    // Act: alice claims to be someone else and addresses only bob.
    alice
        .send(&text("mallory", Recipients::Names(vec!["BOB".to_string()]), "psst"))
        .await;
    alice.send(&text("alice", Recipients::All, "hello all")).await;

    // Assert
    match bob.recv_skipping_rosters().await {
        RelayMessage::Package(package) => {
            assert_eq!(package.sender, "alice");
            assert_eq!(package.payload, b"psst");
        }
        other => panic!("expected Package, got {other:?}"),
    }
    match carol.recv_skipping_rosters().await {
        RelayMessage::Package(package) => assert_eq!(package.payload, b"hello all"),
        other => panic!("expected Package, got {other:?}"),
    }
    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_content_type_reports_error_and_keeps_member() {
    let server = start_server(SessionLimits::default()).await;
    let mut alice = RawClient::joined(server.local_addr(), "alice").await;

    alice
        .send(&RelayMessage::Package(PackageMessage {
            sender: "alice".to_string(),
            recipients: Recipients::All,
            content_type: String::new(),
            payload: Vec::new(),
        }))
        .await;

    match alice.recv_skipping_rosters().await {
        RelayMessage::Error(ErrorMessage { error_code, .. }) => {
            assert_eq!(error_code, ProtocolErrorCode::InvalidPackage);
        }
        other => panic!("expected Error, got {other:?}"),
    }
    alice.send(&RelayMessage::Ping(9)).await;
    assert_eq!(alice.recv_skipping_rosters().await, RelayMessage::Pong(9));
    server.shutdown().await;
}

#[tokio::test]
async fn test_package_at_the_frame_limit_is_relayed() {
    // Arrange
    let server = start_server(SessionLimits::default()).await;
    let addr = server.local_addr();
    let mut alice = RawClient::joined(addr, "alice").await;
    let mut bob = RawClient::joined(addr, "bob").await;
    alice.wait_for_roster(&["alice", "bob"]).await;
    let package = full_size_package("alice");
    let expected_len = package.payload.len();

    // Act
    alice.send(&RelayMessage::Package(package)).await;

    // Assert
    match bob.recv_skipping_rosters().await {
        RelayMessage::Package(received) => {
            assert_eq!(received.sender, "alice");
            assert_eq!(received.payload.len(), expected_len);
            assert_eq!(received.encoded_len(), MAX_PAYLOAD_LEN);
        }
        other => panic!("expected Package, got {other:?}"),
    }
    server.shutdown().await;
}

#[tokio::test]
async fn test_package_too_large_once_stamped_is_refused_without_harming_others() {
    // Arrange: an anonymous package that only fits while the sender is empty
    let server = start_server(SessionLimits::default()).await;
    let addr = server.local_addr();
    let mut alice = RawClient::joined(addr, "alice").await;
    let mut bob = RawClient::joined(addr, "bob").await;
    alice.wait_for_roster(&["alice", "bob"]).await;

    // Act
    alice
        .send(&RelayMessage::Package(full_size_package("")))
        .await;
    alice.send(&text("alice", Recipients::All, "hi")).await;

    // Assert: alice is told, bob only ever sees the small package
    match alice.recv_skipping_rosters().await {
        RelayMessage::Error(ErrorMessage { error_code, .. }) => {
            assert_eq!(error_code, ProtocolErrorCode::InvalidPackage);
        }
        other => panic!("expected Error, got {other:?}"),
    }
    match bob.recv_skipping_rosters().await {
        RelayMessage::Package(package) => assert_eq!(package.payload, b"hi"),
        other => panic!("expected Package, got {other:?}"),
    }
    let names: Vec<String> = server.members().await.into_iter().map(|m| m.name).collect();
    assert_eq!(names, ["alice", "bob"]);
    server.shutdown().await;
}

#[tokio::test]
async fn test_leaving_member_disappears_from_roster() {
    let server = start_server(SessionLimits::default()).await;
    let addr = server.local_addr();
    let mut alice = RawClient::joined(addr, "alice").await;
    let mut bob = RawClient::joined(addr, "bob").await;
    alice.wait_for_roster(&["alice", "bob"]).await;

    bob.send(&RelayMessage::Disconnect {
        reason: DisconnectReason::ClientLeaving,
    })
    .await;

    alice.wait_for_roster(&["alice"]).await;
    bob.expect_closed().await;
    server.shutdown().await;
}

// ── Protocol violations and timers ────────────────────────────────────────────

#[tokio::test]
async fn test_garbage_header_gets_error_then_disconnect() {
    let server = start_server(SessionLimits::default()).await;
    let mut client = RawClient::connect(server.local_addr()).await;

    client.writer.write_all(&[0xFF; 24]).await.unwrap();

    match client.recv().await {
        RelayMessage::Error(ErrorMessage { error_code, .. }) => {
            assert_eq!(error_code, ProtocolErrorCode::UnsupportedVersion);
        }
        other => panic!("expected Error, got {other:?}"),
    }
    assert_eq!(
        client.recv().await,
        RelayMessage::Disconnect {
            reason: DisconnectReason::ProtocolViolation
        }
    );
    client.expect_closed().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_second_join_from_member_is_a_violation() {
    let server = start_server(SessionLimits::default()).await;
    let mut alice = RawClient::joined(server.local_addr(), "alice").await;

    alice.send(&join("alice2")).await;

    match alice.recv_skipping_rosters().await {
        RelayMessage::Error(ErrorMessage { error_code, .. }) => {
            assert_eq!(error_code, ProtocolErrorCode::UnexpectedMessage);
        }
        other => panic!("expected Error, got {other:?}"),
    }
    assert_eq!(
        alice.recv_skipping_rosters().await,
        RelayMessage::Disconnect {
            reason: DisconnectReason::ProtocolViolation
        }
    );
    alice.expect_closed().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_silent_connection_times_out_during_handshake() {
    let server = start_server(SessionLimits {
        handshake_timeout: Duration::from_millis(200),
        ..SessionLimits::default()
    })
    .await;
    let mut client = RawClient::connect(server.local_addr()).await;

    match client.recv().await {
        RelayMessage::Error(ErrorMessage { error_code, .. }) => {
            assert_eq!(error_code, ProtocolErrorCode::HandshakeTimeout);
        }
        other => panic!("expected Error, got {other:?}"),
    }
    client.expect_closed().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_member_that_ignores_pings_is_dropped() {
    let server = start_server(SessionLimits {
        keepalive_interval: Duration::from_millis(200),
        ..SessionLimits::default()
    })
    .await;
    let mut events = server.subscribe();
    let mut alice = RawClient::joined(server.local_addr(), "alice").await;

    assert!(matches!(
        alice.recv_skipping_rosters().await,
        RelayMessage::Ping(_)
    ));
    assert_eq!(
        alice.recv_skipping_rosters().await,
        RelayMessage::Disconnect {
            reason: DisconnectReason::Unresponsive
        }
    );

    let left = timeout(WAIT, async {
        loop {
            if let Ok(RelayEvent::ClientLeft { cause, .. }) = events.recv().await {
                return cause;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(left.to_string(), "unresponsive");
    server.shutdown().await;
}

// ── Administration ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_kick_sends_disconnect_and_updates_roster() {
    // Arrange
    let server = start_server(SessionLimits::default()).await;
    let addr = server.local_addr();
    let mut alice = RawClient::joined(addr, "alice").await;
    let mut bob = RawClient::joined(addr, "bob").await;
    alice.wait_for_roster(&["alice", "bob"]).await;

    // Act
    let kicked = server.kick("BOB").await.unwrap();

    // Assert
    assert_eq!(kicked.name(), "bob");
    assert_eq!(
        bob.recv_skipping_rosters().await,
        RelayMessage::Disconnect {
            reason: DisconnectReason::Kicked
        }
    );
    bob.expect_closed().await;
    alice.wait_for_roster(&["alice"]).await;
    assert!(server.kick("bob").await.is_err());
    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_disconnects_everyone_and_closes_listener() {
    // Arrange
    let server = start_server(SessionLimits::default()).await;
    let addr = server.local_addr();
    let mut alice = RawClient::joined(addr, "alice").await;
    let mut bob = RawClient::joined(addr, "bob").await;

    // Act
    server.shutdown().await;

    // Assert
    for client in [&mut alice, &mut bob] {
        assert_eq!(
            client.recv_skipping_rosters().await,
            RelayMessage::Disconnect {
                reason: DisconnectReason::ServerShutdown
            }
        );
        client.expect_closed().await;
    }
    assert!(TcpStream::connect(addr).await.is_err());
}
