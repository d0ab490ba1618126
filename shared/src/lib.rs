//! Wire protocol shared by the chat server and client.
//!
//! Every message is a single UTF-8 line terminated by `\n`. The first line a
//! client sends is its username; the server answers with one of the handshake
//! tokens below or with a free-text welcome line.

use std::time::Duration;

pub mod config;

pub use config::{ConfigError, Mode};

pub const USERNAME_INVALID: &str = "USERNAME_INVALID";
pub const USER_ALREADY_EXISTS: &str = "USER_ALREADY_EXISTS";
pub const QUIT_COMMAND: &str = "quit";
pub const INACTIVITY_NOTICE: &str = "Inactivity timeout reached. Closing connection.";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;

/// Idle deadline used when every connection gets its own task
pub const POOLED_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Idle deadline used by the single-dispatcher queue variant
pub const QUEUED_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server reply to the username line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Welcome(String),
    UsernameInvalid,
    UserAlreadyExists,
}

impl HandshakeReply {
    /// Interprets the first line received from the server.
    ///
    /// Anything other than the two rejection tokens means the username was
    /// accepted, and the line itself is the greeting.
    pub fn parse(line: &str) -> Self {
        match line {
            USERNAME_INVALID => HandshakeReply::UsernameInvalid,
            USER_ALREADY_EXISTS => HandshakeReply::UserAlreadyExists,
            welcome => HandshakeReply::Welcome(welcome.to_string()),
        }
    }

    pub fn welcome(username: &str) -> Self {
        HandshakeReply::Welcome(format!(
            "Hello, {}! The server is ready to process your connection.",
            username
        ))
    }

    pub fn as_line(&self) -> &str {
        match self {
            HandshakeReply::Welcome(text) => text,
            HandshakeReply::UsernameInvalid => USERNAME_INVALID,
            HandshakeReply::UserAlreadyExists => USER_ALREADY_EXISTS,
        }
    }

    pub fn is_rejection(&self) -> bool {
        !matches!(self, HandshakeReply::Welcome(_))
    }
}

/// Trims a candidate username, returning `None` when nothing is left
pub fn normalize_username(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// True when the line asks the server to end the session
pub fn is_quit(line: &str) -> bool {
    line.eq_ignore_ascii_case(QUIT_COMMAND)
}
