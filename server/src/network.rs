//! Server network layer: listening socket, accept loop and worker dispatch

use crate::connection::{Connection, ConnectionId};
use crate::session::{ClientSession, SessionEnd};
use crate::session_registry::SessionRegistry;
use log::{debug, error, info, log, Level};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("accept loop terminated abnormally: {0}")]
    Task(#[from] JoinError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How accepted connections are handed to session workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DispatchMode {
    /// One task per connection; every session progresses independently
    Pooled,
    /// FIFO pending queue drained by a single dispatcher task. Sessions run
    /// one at a time: a second client is only served after the first ends.
    Queued,
}

impl DispatchMode {
    pub fn default_idle_timeout(self) -> Duration {
        match self {
            DispatchMode::Pooled => shared::POOLED_IDLE_TIMEOUT,
            DispatchMode::Queued => shared::QUEUED_IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub idle_timeout: Duration,
    pub dispatch: DispatchMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: shared::DEFAULT_HOST.to_string(),
            port: shared::DEFAULT_PORT,
            idle_timeout: DispatchMode::Pooled.default_idle_timeout(),
            dispatch: DispatchMode::Pooled,
        }
    }
}

impl ServerConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Switches dispatch mode and adopts that mode's idle deadline
    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self.idle_timeout = dispatch.default_idle_timeout();
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Lifecycle of the accept loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Listening,
    Stopping,
}

/// Server controller owning the listening socket and the worker pool
///
/// Dropping the controller stops the server.
pub struct ChatServer {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    state: Arc<watch::Sender<ServerState>>,
    accept_task: Option<JoinHandle<()>>,
}

impl ChatServer {
    /// Binds the listening socket and starts accepting clients
    pub async fn start(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.address(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(
            "Server listening on {} ({:?} dispatch, {}s idle timeout)",
            local_addr,
            config.dispatch,
            config.idle_timeout.as_secs()
        );

        let registry = Arc::new(SessionRegistry::new());
        let (state, state_rx) = watch::channel(ServerState::Listening);
        let state = Arc::new(state);

        let accept_loop = AcceptLoop {
            listener,
            registry: Arc::clone(&registry),
            idle_timeout: config.idle_timeout,
            dispatch: config.dispatch,
            state: Arc::clone(&state),
            state_rx,
            next_connection_id: 1,
        };

        Ok(Self {
            local_addr,
            registry,
            state,
            accept_task: Some(tokio::spawn(accept_loop.run())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Signals the accept loop to shut down. Does not wait.
    ///
    /// The accept loop closes the listening socket and aborts every session
    /// still in flight; their registry entries and sockets are released as the
    /// tasks unwind. Calling `stop` on a server that is not listening is a
    /// no-op.
    pub fn stop(&self) {
        let signalled = self.state.send_if_modified(|state| {
            if *state == ServerState::Listening {
                *state = ServerState::Stopping;
                true
            } else {
                false
            }
        });

        if signalled {
            info!("Server on {} will be shut down...", self.local_addr);
        }
    }

    /// Waits until the accept loop and every aborted session have finished
    pub async fn wait(mut self) -> Result<(), ServerError> {
        if let Some(task) = self.accept_task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for ChatServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs a server until Ctrl+C, then stops it gracefully
pub async fn run_until_ctrl_c(config: ServerConfig) -> Result<(), ServerError> {
    let server = ChatServer::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");

    server.stop();
    server.wait().await
}

/// Where accepted connections go
enum Dispatcher {
    Pooled(JoinSet<SessionEnd>),
    Queued {
        pending: mpsc::UnboundedSender<Connection>,
        worker: JoinHandle<()>,
    },
}

impl Dispatcher {
    fn new(mode: DispatchMode, registry: &Arc<SessionRegistry>, idle_timeout: Duration) -> Self {
        match mode {
            DispatchMode::Pooled => Dispatcher::Pooled(JoinSet::new()),
            DispatchMode::Queued => {
                let (pending, queue) = mpsc::unbounded_channel();
                let worker = tokio::spawn(drain_queue(queue, Arc::clone(registry), idle_timeout));
                Dispatcher::Queued { pending, worker }
            }
        }
    }

    fn dispatch(
        &mut self,
        connection: Connection,
        registry: &Arc<SessionRegistry>,
        idle_timeout: Duration,
    ) {
        match self {
            Dispatcher::Pooled(sessions) => {
                let session = ClientSession::new(connection, Arc::clone(registry), idle_timeout);
                sessions.spawn(session.run());
            }
            Dispatcher::Queued { pending, .. } => {
                if let Err(e) = pending.send(connection) {
                    error!("Failed to queue connection {}", e.0.id());
                }
            }
        }
    }

    /// Reaps one finished pooled session; pending forever in queued mode
    async fn reap(&mut self) {
        match self {
            Dispatcher::Pooled(sessions) if !sessions.is_empty() => {
                if let Some(result) = sessions.join_next().await {
                    log_session_result(result);
                }
            }
            _ => std::future::pending().await,
        }
    }

    /// Cancels every outstanding session, queued or running, and waits for
    /// the cancelled tasks to release their resources
    async fn abort_all(self) {
        match self {
            Dispatcher::Pooled(mut sessions) => {
                if !sessions.is_empty() {
                    info!("Aborting {} active sessions", sessions.len());
                }
                sessions.abort_all();
                while let Some(result) = sessions.join_next().await {
                    log_session_result(result);
                }
            }
            Dispatcher::Queued { pending, worker } => {
                drop(pending);
                worker.abort();
                if let Err(e) = worker.await {
                    if e.is_panic() {
                        error!("Queue worker panicked: {}", e);
                    }
                }
            }
        }
    }
}

struct AcceptLoop {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
    dispatch: DispatchMode,
    state: Arc<watch::Sender<ServerState>>,
    state_rx: watch::Receiver<ServerState>,
    next_connection_id: ConnectionId,
}

impl AcceptLoop {
    fn is_running(&self) -> bool {
        *self.state_rx.borrow() == ServerState::Listening
    }

    async fn run(mut self) {
        let mut dispatcher = Dispatcher::new(self.dispatch, &self.registry, self.idle_timeout);

        loop {
            tokio::select! {
                changed = self.state_rx.changed() => {
                    if changed.is_err() || !self.is_running() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let connection = self.accept_connection(stream, addr);
                        dispatcher.dispatch(connection, &self.registry, self.idle_timeout);
                    }
                    Err(e) => {
                        let state = *self.state_rx.borrow();
                        if accept_error_ends_loop(state, &e) {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = dispatcher.reap() => {}
            }
        }

        let AcceptLoop {
            listener, state, ..
        } = self;
        drop(listener);
        dispatcher.abort_all().await;

        state.send_replace(ServerState::Stopped);
        info!("Server stopped");
    }

    fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) -> Connection {
        let id = self.next_connection_id;
        self.next_connection_id += 1;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }
        info!("Connection {} accepted from {}", id, addr);
        Connection::accepted(id, stream, addr)
    }
}

/// Queue variant: serves pending connections strictly one after another
async fn drain_queue(
    mut queue: mpsc::UnboundedReceiver<Connection>,
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
) {
    while let Some(connection) = queue.recv().await {
        debug!("Dequeued connection {} from {}", connection.id(), connection.addr());
        let end = ClientSession::new(connection, Arc::clone(&registry), idle_timeout)
            .run()
            .await;
        log_session_result(Ok(end));
    }
}

/// Logs a failed accept and returns true if the loop should stop.
///
/// Failures once shutdown has begun are expected and only logged at debug.
fn accept_error_ends_loop(state: ServerState, e: &io::Error) -> bool {
    if state != ServerState::Listening {
        debug!("Accept interrupted by shutdown: {}", e);
        return true;
    }
    error!("Error accepting connection: {}", e);
    false
}

fn session_log_level(result: &Result<SessionEnd, JoinError>) -> Level {
    match result {
        Ok(SessionEnd::Fault(_)) => Level::Warn,
        Ok(_) => Level::Debug,
        Err(e) if e.is_panic() => Level::Error,
        Err(_) => Level::Debug,
    }
}

fn log_session_result(result: Result<SessionEnd, JoinError>) {
    let level = session_log_level(&result);
    match result {
        Ok(SessionEnd::Fault(e)) => log!(level, "Session ended with error: {}", e),
        Ok(end) => log!(level, "Session ended: {:?}", end),
        Err(e) => log!(level, "Session task did not complete: {}", e),
    }
}
