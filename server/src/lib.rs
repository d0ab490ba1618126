//! # Chat Server Library
//!
//! This library implements the server side of a line-oriented TCP chat. Clients
//! register a username with their first line; every following line is relayed
//! to all other connected clients.
//!
//! ## Core Responsibilities
//!
//! ### Session Lifecycle
//! Each accepted connection is driven by its own session worker:
//! - Username handshake and uniqueness arbitration
//! - Relaying lines to the other sessions
//! - Idle eviction after a configurable read deadline
//! - Guaranteed cleanup on every exit path
//!
//! ### Broadcasting
//! Lines are written to a point-in-time snapshot of the other registered
//! sessions. A failed write to one recipient is logged and never stops
//! delivery to the rest, nor reaches the sender.
//!
//! ### Shutdown
//! Stopping the server closes the listening socket and aborts the sessions
//! still in flight without waiting on their blocked reads.
//!
//! ## Module Organization
//!
//! ### Connection Module (`connection`)
//! Line reader and shared line writer around one accepted socket.
//!
//! ### Session Registry Module (`session_registry`)
//! Concurrent username → connection map with atomic check-and-insert and
//! owner-checked removal, plus the drop guard that releases an entry.
//!
//! ### Broadcast Module (`broadcast`)
//! Best-effort fan-out of one line to every other session.
//!
//! ### Session Module (`session`)
//! The per-connection state machine.
//!
//! ### Network Module (`network`)
//! Listening socket, accept loop, worker dispatch (pooled or queued) and the
//! server controller.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ChatServer::start(ServerConfig::new("127.0.0.1", 8080)).await?;
//!     println!("Listening on {}", server.local_addr());
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop();
//!     server.wait().await?;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod connection;
pub mod network;
pub mod session;
pub mod session_registry;

pub use network::{ChatServer, DispatchMode, ServerConfig, ServerError, ServerState};
