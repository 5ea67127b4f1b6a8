// packages/proxy/src/orchestrator/events.rs
//! Events consumed by the orchestrator loop
//!
//! Every background task (accept loops, upstream connects, session relays,
//! process monitor, signal listeners, timers) reports through this channel.
//! The loop handles one event at a time, so handlers never race.

use crate::routing::region::ServerTarget;
use crate::runtime::process_monitor::ProcessPresence;
use crate::session::proxy_session::SessionId;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub type EventSender = mpsc::UnboundedSender<ProxyEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ProxyEvent>;

/// Why a drain was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Hangup,
    Interrupt,
    Terminate,
    /// Host redirection could not be established
    RedirectionFailure,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ShutdownReason::Hangup => "SIGHUP",
            ShutdownReason::Interrupt => "SIGINT",
            ShutdownReason::Terminate => "SIGTERM",
            ShutdownReason::RedirectionFailure => "redirection failure",
        };
        f.write_str(text)
    }
}

/// Lifecycle report from a session task
#[derive(Debug)]
pub enum SessionSignal {
    UpstreamConnected { upstream_addr: SocketAddr },
    UpstreamFailed(io::Error),
    HandshakeComplete,
    /// Relay finished; `Some` when it ended on a socket error
    Ended(Option<io::Error>),
}

/// Orchestrator input
#[derive(Debug)]
pub enum ProxyEvent {
    Accepted {
        logical_id: String,
        target: ServerTarget,
        stream: TcpStream,
        peer: SocketAddr,
    },
    Session {
        id: SessionId,
        signal: SessionSignal,
    },
    Process(ProcessPresence),
    AutoRevertElapsed {
        generation: u64,
    },
    ShutdownRequested(ShutdownReason),
    GraceElapsed,
}

/// Create the orchestrator channel
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
