// packages/proxy/src/session/mod.rs
//! Proxied client sessions
//!
//! - **ProxySession**: per-connection record and lifecycle
//! - **Engine**: protocol engine seam plus a passthrough relay
//! - **Failure**: user-facing classification of socket errors

pub mod engine;
pub mod failure;
pub mod proxy_session;

pub use engine::{ConnectionParams, EngineEvents, PassthroughEngine, ProtocolEngine, TcpConnector, UpstreamConnector};
pub use failure::ConnectionFailure;
pub use proxy_session::{spawn_session_task, ProxySession, SessionEvent, SessionId, SessionState, SessionTask};
