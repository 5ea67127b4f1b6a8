// packages/proxy/src/session/proxy_session.rs
//! One proxied client connection
//!
//! ```text
//! Connecting ──upstream connected──► Active ──closed / error / close──► Closing ──purged──► Closed
//!     │                                                                                     ▲
//!     └──────────── upstream failed / close requested ─────────────────────────────────────┘
//! ```
//!
//! The session record lives in the orchestrator; the socket work happens in a
//! task spawned by [`spawn_session_task`], which reports back through the
//! event channel.

use crate::modules::loader::ModuleNamespace;
use crate::orchestrator::events::{EventSender, ProxyEvent, SessionSignal};
use crate::routing::region::ServerTarget;
use crate::session::engine::{ConnectionParams, EngineEvents, ProtocolEngine, UpstreamConnector};
use chrono::{DateTime, Utc};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use ulid::Ulid;

/// Unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Ulid);

impl SessionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Inputs to the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    UpstreamConnected,
    UpstreamFailed,
    UpstreamClosed,
    SocketError,
    CloseRequested,
    Purged,
}

impl SessionState {
    /// Next state, or `None` if `event` does not apply in this state
    pub fn next(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent::*;
        use SessionState::*;

        match (self, event) {
            (Connecting, UpstreamConnected) => Some(Active),
            (Connecting, UpstreamFailed | CloseRequested) => Some(Closed),
            (Active, UpstreamClosed | SocketError | CloseRequested) => Some(Closing),
            (Closing, Purged) => Some(Closed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

/// Session record owned by the orchestrator
pub struct ProxySession {
    pub id: SessionId,
    pub logical_id: String,
    pub target: ServerTarget,
    pub downstream_addr: SocketAddr,
    pub upstream_addr: Option<SocketAddr>,
    pub created_at: DateTime<Utc>,
    state: SessionState,
    modules: ModuleNamespace,
    close: CancellationToken,
}

impl ProxySession {
    pub fn new(logical_id: impl Into<String>, target: ServerTarget, downstream_addr: SocketAddr) -> Self {
        Self {
            id: SessionId::new(),
            logical_id: logical_id.into(),
            target,
            downstream_addr,
            upstream_addr: None,
            created_at: Utc::now(),
            state: SessionState::Connecting,
            modules: ModuleNamespace::new(),
            close: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn modules(&self) -> &ModuleNamespace {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut ModuleNamespace {
        &mut self.modules
    }

    /// Time since the client connected
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// Token the session task watches for close requests
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Apply a lifecycle event; returns whether the state changed
    pub fn apply(&mut self, event: SessionEvent) -> bool {
        match self.state.next(event) {
            Some(next) => {
                debug!(session = %self.id, "{:?} -> {:?} on {:?}", self.state, next, event);
                self.state = next;
                true
            }
            None => {
                debug!(session = %self.id, "Ignoring {:?} in state {:?}", event, self.state);
                false
            }
        }
    }

    /// Ask the session task to close both sockets
    pub fn request_close(&mut self) {
        self.close.cancel();
        self.apply(SessionEvent::CloseRequested);
    }

    /// Tear down the module namespace and finish the lifecycle
    pub fn purge(&mut self) -> usize {
        self.close.cancel();
        let unloaded = self.modules.purge();
        self.apply(SessionEvent::Purged);
        unloaded
    }
}

/// Everything a session task needs besides the downstream socket
#[derive(Clone)]
pub struct SessionTask {
    pub id: SessionId,
    pub target: ServerTarget,
    pub connect_timeout: Duration,
    pub connector: Arc<dyn UpstreamConnector>,
    pub engine: Arc<dyn ProtocolEngine>,
    pub params: ConnectionParams,
    pub events: EventSender,
    pub close: CancellationToken,
}

/// Connect upstream and run the engine until the connection ends
pub fn spawn_session_task(task: SessionTask, downstream: TcpStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        let SessionTask {
            id,
            target,
            connect_timeout,
            connector,
            engine,
            params,
            events,
            close,
        } = task;

        let send = |signal: SessionSignal| {
            let _ = events.send(ProxyEvent::Session { id, signal });
        };

        let connect = tokio::time::timeout(connect_timeout, connector.connect(&target));
        let upstream = tokio::select! {
            _ = close.cancelled() => {
                send(SessionSignal::Ended(None));
                return;
            }
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    send(SessionSignal::UpstreamFailed(e));
                    return;
                }
                Err(_) => {
                    send(SessionSignal::UpstreamFailed(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {} timed out after {:?}", target, connect_timeout),
                    )));
                    return;
                }
            }
        };

        let _ = upstream.set_nodelay(true);
        let upstream_addr = match upstream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                send(SessionSignal::UpstreamFailed(e));
                return;
            }
        };
        send(SessionSignal::UpstreamConnected { upstream_addr });

        let relay = engine.run(params, downstream, upstream, EngineEvents::new(id, events.clone()));
        let outcome = tokio::select! {
            result = relay => result.err(),
            _ = close.cancelled() => None,
        };
        send(SessionSignal::Ended(outcome));
    })
}
