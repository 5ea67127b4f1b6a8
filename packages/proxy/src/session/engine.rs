// packages/proxy/src/session/engine.rs
//! Upstream protocol engine seam
//!
//! The engine owns the game protocol spoken over a connected socket pair.
//! The proxy only needs two things from it: a handshake-completion signal
//! (which triggers the `versioncheck` module pass) and a future that
//! resolves when the connection is over.

use crate::orchestrator::events::{EventSender, ProxyEvent, SessionSignal};
use crate::routing::region::ServerTarget;
use crate::session::proxy_session::SessionId;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

/// Per-connection engine parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Region short code, e.g. `eu`
    pub region: String,
    pub console: bool,
    pub classic: bool,
    pub protocol_data: Arc<HashMap<String, serde_json::Value>>,
}

/// Lets an engine report protocol milestones for its session
#[derive(Clone)]
pub struct EngineEvents {
    session_id: SessionId,
    events: EventSender,
}

impl EngineEvents {
    pub fn new(session_id: SessionId, events: EventSender) -> Self {
        Self { session_id, events }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The client and server finished their version handshake
    pub fn handshake_complete(&self) {
        let _ = self.events.send(ProxyEvent::Session {
            id: self.session_id,
            signal: SessionSignal::HandshakeComplete,
        });
    }
}

/// Game protocol engine
pub trait ProtocolEngine: Send + Sync {
    /// Drive one connection until either side closes
    ///
    /// Dropping the returned future must close both sockets.
    fn run(
        &self,
        params: ConnectionParams,
        downstream: TcpStream,
        upstream: TcpStream,
        events: EngineEvents,
    ) -> BoxFuture<'static, io::Result<()>>;
}

/// Transparent relay without protocol awareness
///
/// There is no version exchange to wait for, so the handshake is reported
/// as complete as soon as the relay starts.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEngine;

impl ProtocolEngine for PassthroughEngine {
    fn run(
        &self,
        params: ConnectionParams,
        mut downstream: TcpStream,
        mut upstream: TcpStream,
        events: EngineEvents,
    ) -> BoxFuture<'static, io::Result<()>> {
        Box::pin(async move {
            debug!(session = %events.session_id(), region = %params.region, "Starting passthrough relay");
            events.handshake_complete();

            let (to_server, to_client) = tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await?;
            debug!(
                session = %events.session_id(),
                "Relay finished ({} bytes to server, {} bytes to client)",
                to_server,
                to_client
            );
            Ok(())
        })
    }
}

/// Opens the upstream socket for a session
pub trait UpstreamConnector: Send + Sync {
    fn connect(&self, target: &ServerTarget) -> BoxFuture<'static, io::Result<TcpStream>>;
}

/// Plain TCP connect to the target address
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl UpstreamConnector for TcpConnector {
    fn connect(&self, target: &ServerTarget) -> BoxFuture<'static, io::Result<TcpStream>> {
        let ip = target.ip.clone();
        let port = target.port;
        Box::pin(async move { TcpStream::connect((ip.as_str(), port)).await })
    }
}
