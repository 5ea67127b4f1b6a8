// packages/proxy/src/interception/mod.rs
//! Hostname interception layer
//!
//! The game client finds its server list by hostname. While the client runs,
//! those hostnames are pointed at the local listen address through the OS
//! hosts file:
//!
//! - **Hosts File**: tagged, idempotent hosts file entries
//! - **Redirection**: state machine toggling the entries on process presence
//!
//! # Architecture
//!
//! ```text
//! Game Client
//!     │
//!     ├─ DNS lookup (sls.example.com) → hosts file → listen hostname
//!     ├─ Server list request → local directory server (rewritten list)
//!     └─ Game connection → local listener → upstream game server
//! ```

pub mod hosts_file;
pub mod redirection;

// Re-export commonly used types
pub use hosts_file::{HostsError, HostsErrorKind, HostsFile, HostsStore};
pub use redirection::{HostRedirection, RedirectionState};
