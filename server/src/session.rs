//! Per-connection session worker
//!
//! Each accepted connection is driven through
//! `AwaitingUsername -> Active -> Closing -> Closed`. The username is claimed
//! through a [`Registration`] guard, so the registry entry is released however
//! the worker exits, including when its task is aborted during shutdown.

use crate::broadcast::Broadcaster;
use crate::connection::Connection;
use crate::session_registry::{Registration, SessionRegistry};
use log::{debug, info, warn};
use shared::{is_quit, normalize_username, HandshakeReply, INACTIVITY_NOTICE};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingUsername,
    Active,
    Closing,
    Closed,
}

/// Why a session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// Empty or whitespace-only username
    UsernameInvalid,
    /// Username held by another session
    UsernameTaken,
    /// Client sent `quit`
    ClientQuit,
    /// No line arrived within the idle deadline
    IdleTimeout,
    /// Peer closed its side of the connection
    PeerClosed,
    /// Read or write failure on this connection
    Fault(io::Error),
}

enum ReadOutcome {
    Line(String),
    Closed,
    TimedOut,
    Failed(io::Error),
}

pub struct ClientSession {
    connection: Connection,
    registry: Arc<SessionRegistry>,
    broadcaster: Broadcaster,
    idle_timeout: Duration,
    state: SessionState,
}

impl ClientSession {
    pub fn new(
        connection: Connection,
        registry: Arc<SessionRegistry>,
        idle_timeout: Duration,
    ) -> Self {
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        Self {
            connection,
            registry,
            broadcaster,
            idle_timeout,
            state: SessionState::AwaitingUsername,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the session to completion and closes the connection
    pub async fn run(mut self) -> SessionEnd {
        let end = match self.authenticate().await {
            Ok(registration) => self.serve(registration).await,
            Err(end) => end,
        };

        self.transition(SessionState::Closing);
        self.connection.close().await;
        self.transition(SessionState::Closed);
        end
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            "Connection {}: {:?} -> {:?}",
            self.connection.id(),
            self.state,
            next
        );
        self.state = next;
    }

    /// Reads one line, bounded by the idle deadline
    async fn next_line(&mut self) -> ReadOutcome {
        match timeout(self.idle_timeout, self.connection.read_line()).await {
            Err(_) => ReadOutcome::TimedOut,
            Ok(Ok(Some(line))) => ReadOutcome::Line(line),
            Ok(Ok(None)) => ReadOutcome::Closed,
            Ok(Err(e)) => ReadOutcome::Failed(e),
        }
    }

    async fn reply(&mut self, reply: &HandshakeReply) -> Result<(), SessionEnd> {
        self.connection
            .write_line(reply.as_line())
            .await
            .map_err(SessionEnd::Fault)
    }

    /// Reads the username line and claims it in the registry
    async fn authenticate(&mut self) -> Result<Registration, SessionEnd> {
        let raw = match self.next_line().await {
            ReadOutcome::Line(line) => line,
            ReadOutcome::Closed => return Err(SessionEnd::PeerClosed),
            ReadOutcome::TimedOut => {
                info!(
                    "Connection {} sent no username before the deadline",
                    self.connection.addr()
                );
                return Err(SessionEnd::IdleTimeout);
            }
            ReadOutcome::Failed(e) => {
                warn!("Error reading username from {}: {}", self.connection.addr(), e);
                return Err(SessionEnd::Fault(e));
            }
        };

        let Some(username) = normalize_username(&raw) else {
            info!("Rejected empty username from {}", self.connection.addr());
            self.reply(&HandshakeReply::UsernameInvalid).await?;
            return Err(SessionEnd::UsernameInvalid);
        };

        let Some(registration) =
            Registration::acquire(&self.registry, &username, self.connection.peer().clone())
        else {
            info!(
                "Rejected username {} from {}: already in use",
                username,
                self.connection.addr()
            );
            self.reply(&HandshakeReply::UserAlreadyExists).await?;
            return Err(SessionEnd::UsernameTaken);
        };

        self.reply(&HandshakeReply::welcome(&username)).await?;
        Ok(registration)
    }

    /// Relays lines to the other sessions until quit, timeout or disconnect
    async fn serve(&mut self, registration: Registration) -> SessionEnd {
        self.transition(SessionState::Active);
        let username = registration.username();
        info!("Serving client {} -> {}", username, self.connection.addr());

        loop {
            match self.next_line().await {
                ReadOutcome::Line(line) if is_quit(&line) => {
                    info!(
                        "Connection closed by client: {} -> {}",
                        username,
                        self.connection.addr()
                    );
                    return SessionEnd::ClientQuit;
                }
                ReadOutcome::Line(line) => {
                    debug!("Message from {}: {}", username, line);
                    self.broadcaster.broadcast(username, &line).await;
                }
                ReadOutcome::TimedOut => {
                    info!(
                        "Connection closed, client inactive: {} -> {}",
                        username,
                        self.connection.addr()
                    );
                    if let Err(e) = self.connection.write_line(INACTIVITY_NOTICE).await {
                        debug!("Could not send inactivity notice to {}: {}", username, e);
                    }
                    return SessionEnd::IdleTimeout;
                }
                ReadOutcome::Closed => {
                    info!("Client {} disconnected", username);
                    return SessionEnd::PeerClosed;
                }
                ReadOutcome::Failed(e) => {
                    warn!("Error reading from {}: {}", username, e);
                    return SessionEnd::Fault(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PeerHandle;
    use shared::{USERNAME_INVALID, USER_ALREADY_EXISTS};
    use std::net::SocketAddr;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, WriteHalf};
    use tokio_test::io::Builder;

    const IDLE: Duration = Duration::from_secs(120);

    fn test_addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn mock_session(
        mock: tokio_test::io::Mock,
        registry: &Arc<SessionRegistry>,
    ) -> ClientSession {
        let (reader, writer) = tokio::io::split(mock);
        let connection = Connection::from_parts(1, test_addr(), reader, writer);
        ClientSession::new(connection, Arc::clone(registry), IDLE)
    }

    /// Client end of an in-memory session: line reader plus raw writer
    struct TestClient {
        lines: Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl TestClient {
        async fn send(&mut self, line: &str) {
            self.writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        async fn recv(&mut self) -> Option<String> {
            self.lines.next_line().await.unwrap()
        }
    }

    fn spawn_session(
        id: u64,
        registry: &Arc<SessionRegistry>,
        idle: Duration,
    ) -> (TestClient, tokio::task::JoinHandle<SessionEnd>) {
        let (remote, local) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let connection = Connection::from_parts(id, test_addr(), reader, writer);
        let session = ClientSession::new(connection, Arc::clone(registry), idle);
        assert_eq!(session.state(), SessionState::AwaitingUsername);

        let (remote_reader, remote_writer) = tokio::io::split(remote);
        let client = TestClient {
            lines: BufReader::new(remote_reader).lines(),
            writer: remote_writer,
        };
        (client, tokio::spawn(session.run()))
    }

    #[tokio::test]
    async fn test_blank_username_rejected() {
        let registry = Arc::new(SessionRegistry::new());
        let mock = Builder::new()
            .read(b"   \n")
            .write(format!("{}\n", USERNAME_INVALID).as_bytes())
            .build();

        let end = mock_session(mock, &registry).run().await;

        assert!(matches!(end, SessionEnd::UsernameInvalid));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_taken_username_rejected() {
        let registry = Arc::new(SessionRegistry::new());
        let owner = PeerHandle::new(99, test_addr(), tokio::io::sink());
        assert!(registry.try_register("alice", owner));

        let mock = Builder::new()
            .read(b"alice\n")
            .write(format!("{}\n", USER_ALREADY_EXISTS).as_bytes())
            .build();

        let end = mock_session(mock, &registry).run().await;

        assert!(matches!(end, SessionEnd::UsernameTaken));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot_others("")[0].1.id(), 99);
    }

    #[tokio::test]
    async fn test_welcome_then_quit_releases_name() {
        let registry = Arc::new(SessionRegistry::new());
        let welcome = HandshakeReply::welcome("alice");
        let mock = Builder::new()
            .read(b"  alice  \n")
            .write(format!("{}\n", welcome.as_line()).as_bytes())
            .read(b"QUIT\n")
            .build();

        let end = mock_session(mock, &registry).run().await;

        assert!(matches!(end, SessionEnd::ClientQuit));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_before_username() {
        let registry = Arc::new(SessionRegistry::new());
        let mock = Builder::new().build();

        let end = mock_session(mock, &registry).run().await;

        assert!(matches!(end, SessionEnd::PeerClosed));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_lines_are_broadcast_but_quit_is_not() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut alice, alice_task) = spawn_session(1, &registry, IDLE);
        let (mut bob, _bob_task) = spawn_session(2, &registry, IDLE);

        alice.send("alice").await;
        assert!(alice.recv().await.unwrap().contains("alice"));
        bob.send("bob").await;
        assert!(bob.recv().await.unwrap().contains("bob"));

        alice.send("hello bob").await;
        assert_eq!(bob.recv().await.as_deref(), Some("hello bob"));

        alice.send("quit").await;
        assert!(matches!(alice_task.await.unwrap(), SessionEnd::ClientQuit));
        assert_eq!(alice.recv().await, None);
        assert_eq!(registry.usernames(), vec!["bob"]);

        // Bob's next line must be the one sent after alice left, not "quit"
        let (mut carol, _carol_task) = spawn_session(3, &registry, IDLE);
        carol.send("carol").await;
        carol.recv().await.unwrap();
        carol.send("after").await;
        assert_eq!(bob.recv().await.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_sender_does_not_receive_own_line() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut alice, _alice_task) = spawn_session(1, &registry, IDLE);
        let (mut bob, _bob_task) = spawn_session(2, &registry, IDLE);

        alice.send("alice").await;
        alice.recv().await.unwrap();
        bob.send("bob").await;
        bob.recv().await.unwrap();

        alice.send("one").await;
        assert_eq!(bob.recv().await.as_deref(), Some("one"));
        bob.send("two").await;
        assert_eq!(alice.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_keeps_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut alice, alice_task) = spawn_session(1, &registry, IDLE);
        let (mut bob, _bob_task) = spawn_session(2, &registry, IDLE);

        alice.send("alice").await;
        alice.recv().await.unwrap();
        bob.send("bob").await;
        bob.recv().await.unwrap();

        alice.send_raw(b"caf\xe9\n").await;
        alice.send_raw(b"next\n").await;

        assert_eq!(bob.recv().await.as_deref(), Some("caf\u{fffd}"));
        assert_eq!(bob.recv().await.as_deref(), Some("next"));
        assert!(registry.contains("alice"));
        assert!(!alice_task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_gets_notice_and_is_closed() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut alice, task) = spawn_session(1, &registry, Duration::from_secs(10));

        alice.send("alice").await;
        alice.recv().await.unwrap();

        assert_eq!(alice.recv().await.as_deref(), Some(INACTIVITY_NOTICE));
        assert_eq!(alice.recv().await, None);
        assert!(matches!(task.await.unwrap(), SessionEnd::IdleTimeout));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_rearms_idle_deadline() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut alice, task) = spawn_session(1, &registry, Duration::from_secs(10));

        alice.send("alice").await;
        alice.recv().await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(8)).await;
            alice.send("still here").await;
        }
        tokio::task::yield_now().await;
        assert!(registry.contains("alice"));
        assert!(!task.is_finished());

        assert_eq!(alice.recv().await.as_deref(), Some(INACTIVITY_NOTICE));
        assert!(matches!(task.await.unwrap(), SessionEnd::IdleTimeout));
    }

    #[tokio::test]
    async fn test_aborted_session_releases_name() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut alice, task) = spawn_session(1, &registry, IDLE);

        alice.send("alice").await;
        alice.recv().await.unwrap();
        assert!(registry.contains("alice"));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_abrupt_disconnect_releases_name() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut alice, task) = spawn_session(1, &registry, IDLE);

        alice.send("alice").await;
        alice.recv().await.unwrap();
        drop(alice);

        assert!(matches!(task.await.unwrap(), SessionEnd::PeerClosed));
        assert!(registry.is_empty());
    }
}
