// packages/proxy/src/session/failure.rs
//! Classification of session-scoped socket failures
//!
//! These never take the process down: the session closes, the listener
//! keeps accepting, and the user gets an explanation of the likely cause.

use std::fmt;
use std::io;
use tracing::{error, warn};

/// Category of a connection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionFailure {
    Timeout,
    Reset,
    BrokenPipe,
    Refused,
    Other,
}

impl ConnectionFailure {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ConnectionFailure::Timeout,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => ConnectionFailure::Reset,
            io::ErrorKind::BrokenPipe => ConnectionFailure::BrokenPipe,
            io::ErrorKind::ConnectionRefused => ConnectionFailure::Refused,
            _ => ConnectionFailure::Other,
        }
    }

    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionFailure::Timeout => "timeout",
            ConnectionFailure::Reset => "reset",
            ConnectionFailure::BrokenPipe => "broken_pipe",
            ConnectionFailure::Refused => "refused",
            ConnectionFailure::Other => "other",
        }
    }

    /// Likely causes shown to the user
    pub fn explanation(&self) -> &'static [&'static str] {
        match self {
            ConnectionFailure::Timeout => &[
                "- An unstable internet connection or a geo-IP ban",
                "- Game server maintenance",
            ],
            ConnectionFailure::Reset | ConnectionFailure::BrokenPipe => &[
                "- A disconnect caused by an unstable internet connection",
                "- An exploit/cheat or broken module that got you kicked",
            ],
            ConnectionFailure::Refused => &[
                "- Game server maintenance",
                "- An outdated server list",
            ],
            ConnectionFailure::Other => &[],
        }
    }

    /// Log a categorised, user-facing report for `err` on `peer`
    pub fn report(err: &io::Error, peer: &str) -> Self {
        let failure = Self::classify(err);
        match failure {
            ConnectionFailure::Timeout => {
                error!("ERROR: Unable to connect to game server at {} (timeout)! Common reasons for this are:", peer);
            }
            ConnectionFailure::Reset | ConnectionFailure::BrokenPipe => {
                error!("ERROR: {} - Connection to game server was closed unexpectedly. Common reasons for this are:", failure);
            }
            ConnectionFailure::Refused => {
                error!("ERROR: Game server at {} refused the connection! Common reasons for this are:", peer);
            }
            ConnectionFailure::Other => {
                warn!("Connection error on {}: {}", peer, err);
            }
        }
        for line in failure.explanation() {
            error!("{}", line);
        }
        failure
    }
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionFailure::Timeout => "ETIMEDOUT",
            ConnectionFailure::Reset => "ECONNRESET",
            ConnectionFailure::BrokenPipe => "EPIPE",
            ConnectionFailure::Refused => "ECONNREFUSED",
            ConnectionFailure::Other => "EOTHER",
        };
        f.write_str(text)
    }
}
