// packages/proxy/src/utils/errors.rs
//! Error types shared across the proxy
//!
//! Startup-fatal failures (bind conflicts, directory lookup, hosts baseline)
//! surface as `ProxyError` and terminate the process after a diagnostic.
//! Session-scoped failures are classified separately by
//! [`ConnectionFailure`](crate::session::failure::ConnectionFailure) and never
//! escape the session that produced them.

use crate::interception::hosts_file::HostsError;
use std::time::Duration;
use thiserror::Error;

/// Proxy error type
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Unable to load the server list: {0}")]
    DirectoryFailed(String),

    #[error("Timeout after {0:?} while trying to load the server list")]
    DirectoryTimeout(Duration),

    #[error("Address {addr} is already in use")]
    AddressInUse { addr: String },

    #[error("Permission denied binding {addr}")]
    BindPermissionDenied { addr: String },

    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Hosts(#[from] HostsError),

    #[error("Module {name} failed: {reason}")]
    ModuleFailed { name: String, reason: String },

    #[error("Module update failed: {0}")]
    UpdateFailed(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Remediation lines printed after the error itself
    pub fn hints(&self) -> Vec<String> {
        match self {
            ProxyError::AddressInUse { .. } => vec![
                "Another instance of the proxy is already running, please close it then try again."
                    .to_string(),
            ],
            ProxyError::BindPermissionDenied { addr } => vec![
                format!("Another process is already using {} or the port is privileged.", addr),
                "Please close or uninstall the application first, or run the proxy with elevated privileges."
                    .to_string(),
            ],
            ProxyError::DirectoryFailed(_) | ProxyError::DirectoryTimeout(_) => vec![
                "This is almost always caused by".to_string(),
                " - your setup (invasive virus scanners, ...)".to_string(),
                " - your internet connection (unstable connection, geo-IP ban, ...)".to_string(),
                " - game servers being down for maintenance".to_string(),
                "Please test if you can play the game without the proxy. If you can't, it's not a proxy issue."
                    .to_string(),
            ],
            ProxyError::Hosts(e) => e.remediation(),
            _ => Vec::new(),
        }
    }
}

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<config::ConfigError> for ProxyError {
    fn from(err: config::ConfigError) -> Self {
        ProxyError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::ConfigError(format!("JSON error: {}", err))
    }
}
