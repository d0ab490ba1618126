//! Launch argument validation
//!
//! Every rule here runs before a socket is opened, so a bad invocation fails
//! fast with a [`ConfigError`] instead of a half-started server or client.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("server and client modes must be run separately")]
    ConflictingModes,
    #[error("either server or client mode must be selected")]
    MissingMode,
    #[error("missing required argument --{0}")]
    MissingArgument(&'static str),
    #[error("invalid port '{0}': must be a number between 1 and 65535")]
    InvalidPort(String),
    #[error("ip address must not be empty")]
    EmptyIp,
    #[error("username must not be empty")]
    EmptyUser,
}

/// What the process should run as, with validated arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Server {
        port: u16,
    },
    Client {
        ip: String,
        port: u16,
        user: String,
    },
}

impl Mode {
    /// Resolves raw launch arguments into a mode.
    ///
    /// Exactly one of `server` and `client` must be set. Client mode also
    /// needs an ip and a user; the user is stored trimmed.
    pub fn resolve(
        server: bool,
        client: bool,
        ip: Option<&str>,
        port: Option<&str>,
        user: Option<&str>,
    ) -> Result<Mode, ConfigError> {
        match (server, client) {
            (true, true) => Err(ConfigError::ConflictingModes),
            (false, false) => Err(ConfigError::MissingMode),
            (true, false) => {
                let port = parse_port(port.ok_or(ConfigError::MissingArgument("port"))?)?;
                Ok(Mode::Server { port })
            }
            (false, true) => {
                let ip = parse_ip(ip.ok_or(ConfigError::MissingArgument("ip"))?)?;
                let port = parse_port(port.ok_or(ConfigError::MissingArgument("port"))?)?;
                let user = parse_user(user.ok_or(ConfigError::MissingArgument("user"))?)?;
                Ok(Mode::Client { ip, port, user })
            }
        }
    }
}

/// Parses a port, accepting 1..=65535
pub fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port >= 1 => Ok(port),
        _ => Err(ConfigError::InvalidPort(raw.to_string())),
    }
}

pub fn parse_ip(raw: &str) -> Result<String, ConfigError> {
    let ip = raw.trim();
    if ip.is_empty() {
        return Err(ConfigError::EmptyIp);
    }
    Ok(ip.to_string())
}

pub fn parse_user(raw: &str) -> Result<String, ConfigError> {
    crate::normalize_username(raw).ok_or(ConfigError::EmptyUser)
}
