//! # Chat Client Library
//!
//! Client side of the line chat. A client connects once, registers its
//! username and then runs two loops side by side:
//!
//! - a background printer writing every line received from the server to
//!   the output
//! - the send loop forwarding each input line to the server verbatim
//!
//! Sending `quit` (any case) ends the send loop. The printer is detached and
//! reports when the server closes the connection.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{run_interactive, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     run_interactive(ClientConfig::new("127.0.0.1", 8080, "alice")).await?;
//!     Ok(())
//! }
//! ```

pub mod network;

pub use network::{Client, ClientConfig, ClientError, Handshake};
