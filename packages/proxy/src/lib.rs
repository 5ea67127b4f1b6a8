// packages/proxy/src/lib.rs
//! Game Interception Proxy Library
//!
//! Routes game client connections through a local proxy so that plugin
//! modules can observe and act on each session.
//!
//! # Architecture
//!
//! The proxy is structured into several key modules:
//!
//! - **orchestrator**: event loop owning listeners, sessions and shutdown
//! - **routing**: region profiles, directory resolution, listener provisioning
//! - **interception**: hosts file redirection of the server list hostnames
//! - **session**: per-connection lifecycle and the protocol engine seam
//! - **modules**: plugin discovery and phase-ordered activation
//! - **runtime**: game client process monitoring
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and error types

// Public module exports
pub mod interception;
pub mod modules;
pub mod observability;
pub mod orchestrator;
pub mod routing;
pub mod runtime;
pub mod session;
pub mod utils;

// Re-export commonly used types
pub use orchestrator::{ExitReason, Orchestrator, OrchestratorDeps};
pub use utils::config::ProxyConfig;
pub use utils::errors::{ProxyError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Proxy build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(!info.git_hash.is_empty());
    }
}
