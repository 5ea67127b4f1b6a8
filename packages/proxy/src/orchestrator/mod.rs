// packages/proxy/src/orchestrator/mod.rs
//! Connection routing and session lifecycle orchestration
//!
//! The orchestrator owns every piece of mutable proxy state: listeners,
//! session registries, host redirection and the drain flag. Background tasks
//! only send [`ProxyEvent`]s; the event loop applies them one at a time.
//!
//! # Startup
//!
//! ```text
//! baseline hosts cleanup ─► startup modules ─► resolve targets ─► bind listeners
//!                                                   ─► serve server list ─► watch game client
//! ```

pub mod events;
pub mod shutdown;
pub mod signals;

use crate::interception::hosts_file::HostsStore;
use crate::interception::redirection::{HostRedirection, RedirectionState};
use crate::modules::descriptor::UpdateSnapshot;
use crate::modules::loader::{ActivationPass, ModuleCatalog, ModuleLoader, SessionNotice};
use crate::routing::directory::DirectoryResolver;
use crate::routing::listener::{plan_listeners, provision_all, report_port_owner, ListenerHandle};
use crate::routing::region::{ServerTarget, TargetMap};
use crate::runtime::process_monitor::{ProcessMonitor, ProcessPresence, ProcessProbe};
use crate::session::engine::{ConnectionParams, ProtocolEngine, UpstreamConnector};
use crate::session::failure::ConnectionFailure;
use crate::session::proxy_session::{spawn_session_task, ProxySession, SessionEvent, SessionId, SessionTask};
use crate::utils::config::{RegionContext, TimeoutConfig};
use crate::utils::errors::{ProxyError, Result};
use events::{EventReceiver, EventSender, ProxyEvent, SessionSignal, ShutdownReason};
use metrics::{counter, gauge};
use shutdown::{DrainReport, DrainTargets, ShutdownCoordinator};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use events::channel;

/// Collaborators and settings the orchestrator is built from
pub struct OrchestratorDeps {
    pub region: RegionContext,
    pub timeouts: TimeoutConfig,
    pub process_name: String,
    pub hosts: Box<dyn HostsStore>,
    pub directory: DirectoryResolver,
    pub probe: Box<dyn ProcessProbe>,
    pub connector: Arc<dyn UpstreamConnector>,
    pub engine: Arc<dyn ProtocolEngine>,
    pub catalog: Arc<ModuleCatalog>,
    pub snapshot: Arc<UpdateSnapshot>,
}

/// Why the event loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Every session task finished after the drain
    Drained(ShutdownReason),
    /// The grace timer fired first
    GraceExpired(ShutdownReason),
}

impl ExitReason {
    pub fn shutdown_reason(&self) -> ShutdownReason {
        match self {
            ExitReason::Drained(reason) | ExitReason::GraceExpired(reason) => *reason,
        }
    }

    /// Process exit code
    pub fn exit_code(&self) -> i32 {
        match self.shutdown_reason() {
            ShutdownReason::RedirectionFailure => 1,
            _ => 0,
        }
    }
}

/// Proxy orchestrator context
pub struct Orchestrator {
    region: RegionContext,
    timeouts: TimeoutConfig,
    events_tx: EventSender,
    events_rx: EventReceiver,
    redirection: HostRedirection,
    directory: DirectoryResolver,
    monitor: Option<ProcessMonitor>,
    monitor_cancel: CancellationToken,
    connector: Arc<dyn UpstreamConnector>,
    engine: Arc<dyn ProtocolEngine>,
    loader: ModuleLoader,
    params: ConnectionParams,
    listeners: Vec<ListenerHandle>,
    /// Sessions still connecting upstream
    pending: HashMap<SessionId, ProxySession>,
    /// Sessions with a live upstream
    sessions: HashMap<SessionId, ProxySession>,
    /// Session tasks that have not reported their final signal yet
    live_tasks: HashSet<SessionId>,
    /// Upstream failures by category
    failures: HashMap<ConnectionFailure, u64>,
    /// Port found busy during a failed start
    port_conflict: Option<u16>,
    shutdown: ShutdownCoordinator,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        let (events_tx, events_rx) = events::channel();
        let profile = &deps.region.profile;

        let redirection = HostRedirection::new(
            deps.hosts,
            profile.listen_hostname.clone(),
            profile.hostnames(),
            deps.timeouts.auto_revert(),
            events_tx.clone(),
        );
        let monitor = ProcessMonitor::new(deps.process_name, deps.timeouts.process_poll(), deps.probe);
        let params = ConnectionParams {
            region: deps.region.short_code.clone(),
            console: profile.console,
            classic: profile.classic,
            protocol_data: Arc::new(deps.snapshot.protocol_data.clone()),
        };
        let loader = ModuleLoader::new(deps.catalog, deps.snapshot, deps.region.short_code.clone());
        let shutdown = ShutdownCoordinator::new(deps.timeouts.shutdown_grace(), events_tx.clone());

        Self {
            region: deps.region,
            timeouts: deps.timeouts,
            events_tx,
            events_rx,
            redirection,
            directory: deps.directory,
            monitor: Some(monitor),
            monitor_cancel: CancellationToken::new(),
            connector: deps.connector,
            engine: deps.engine,
            loader,
            params,
            listeners: Vec::new(),
            pending: HashMap::new(),
            sessions: HashMap::new(),
            live_tasks: HashSet::new(),
            failures: HashMap::new(),
            port_conflict: None,
            shutdown,
        }
    }

    /// Sender for background tasks such as the signal listener
    pub fn sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Bring the proxy up; every error returned here is startup-fatal
    pub async fn start(&mut self) -> Result<()> {
        let direct = self.region.profile.is_direct();
        info!(
            "[proxy] starting region {} ({})",
            self.region.name,
            if direct { "direct mode" } else { "redirected mode" }
        );

        if !direct {
            self.redirection.reset_baseline()?;
            gauge!("proxy_redirection_enabled").set(0.0);
        }

        let report = self.loader.run_startup();
        if !report.errors.is_empty() {
            warn!("{} startup module(s) failed to initialize", report.errors.len());
        }

        let targets = self.directory.resolve(self.timeouts.directory()).await?;

        let (plans, missing) = plan_listeners(&self.region.profile, &targets);
        if !missing.is_empty() {
            debug!("Skipped {} unresolved server(s)", missing.len());
        }

        self.listeners = match provision_all(plans, &self.events_tx).await {
            Ok(listeners) => listeners,
            Err(e) => return Err(self.diagnose_startup_failure(e).await),
        };

        if !direct {
            let local = self.local_targets();
            let served = self
                .directory
                .listen(&self.region.profile.listen_hostname, &local)
                .await;
            if let Err(e) = served {
                return Err(self.diagnose_startup_failure(e).await);
            }

            if let Some(monitor) = self.monitor.take() {
                monitor.start(self.events_tx.clone(), self.monitor_cancel.clone());
            }
        }

        info!("[proxy] ready, {} server(s) available", self.listeners.len());
        Ok(())
    }

    /// Report who holds a busy port before the error ends startup
    async fn diagnose_startup_failure(&mut self, e: ProxyError) -> ProxyError {
        if let ProxyError::AddressInUse { addr } = &e {
            if let Some(port) = port_of(addr) {
                report_port_owner(port).await;
                self.port_conflict = Some(port);
            }
        }
        e
    }

    /// Run the event loop until the proxy has drained
    pub async fn run(&mut self) -> ExitReason {
        loop {
            let event = self.next_event().await;
            if let Some(exit) = self.handle(event) {
                return exit;
            }
        }
    }

    /// Next event from the channel
    pub async fn next_event(&mut self) -> ProxyEvent {
        // The orchestrator holds a sender itself, so the channel never closes
        match self.events_rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    /// Apply one event; returns `Some` once the loop should stop
    pub fn handle(&mut self, event: ProxyEvent) -> Option<ExitReason> {
        match event {
            ProxyEvent::Accepted {
                logical_id,
                target,
                stream,
                peer,
            } => self.on_accepted(logical_id, target, stream, peer),
            ProxyEvent::Session { id, signal } => self.on_session_signal(id, signal),
            ProxyEvent::Process(presence) => self.on_process(presence),
            ProxyEvent::AutoRevertElapsed { generation } => self.on_auto_revert(generation),
            ProxyEvent::ShutdownRequested(reason) => {
                self.begin_shutdown(reason);
            }
            ProxyEvent::GraceElapsed => {
                let reason = self.shutdown.reason().unwrap_or(ShutdownReason::Terminate);
                warn!("[proxy] {} session(s) still open after grace period, forcing exit", self.live_tasks.len());
                return Some(ExitReason::GraceExpired(reason));
            }
        }

        self.drain_complete()
    }

    /// Start the drain; later requests are no-ops
    pub fn begin_shutdown(&mut self, reason: ShutdownReason) -> Option<DrainReport> {
        let report = self.shutdown.drain(
            reason,
            DrainTargets {
                sessions: &mut self.sessions,
                pending: &mut self.pending,
                redirection: &mut self.redirection,
                directory: &mut self.directory,
                listeners: &mut self.listeners,
            },
        )?;

        self.monitor_cancel.cancel();
        gauge!("proxy_active_sessions").set(0.0);
        gauge!("proxy_redirection_enabled").set(0.0);
        Some(report)
    }

    pub fn is_draining(&self) -> bool {
        self.shutdown.is_draining()
    }

    pub fn redirection_state(&self) -> RedirectionState {
        self.redirection.state()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_sessions(&self) -> usize {
        self.pending.len()
    }

    /// Upstream failures seen so far in `kind`
    pub fn upstream_failures(&self, kind: ConnectionFailure) -> u64 {
        self.failures.get(&kind).copied().unwrap_or(0)
    }

    pub fn port_conflict(&self) -> Option<u16> {
        self.port_conflict
    }

    pub fn session(&self, id: &SessionId) -> Option<&ProxySession> {
        self.sessions.get(id)
    }

    /// Bound listeners as `(logical id, local address)`
    pub fn listener_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.listeners
            .iter()
            .map(|l| (l.logical_id.clone(), l.local_addr))
            .collect()
    }

    fn local_targets(&self) -> TargetMap {
        self.listeners
            .iter()
            .map(|l| {
                (
                    l.logical_id.clone(),
                    ServerTarget::new(l.local_addr.ip().to_string(), l.local_addr.port()),
                )
            })
            .collect()
    }

    fn on_accepted(&mut self, logical_id: String, target: ServerTarget, stream: TcpStream, peer: SocketAddr) {
        if self.is_draining() {
            debug!("Dropping connection from {} while draining", peer);
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to disable Nagle for {}: {}", peer, e);
        }

        let mut session = ProxySession::new(logical_id, target.clone(), peer);
        let id = session.id;
        let report = self.loader.activate(ActivationPass::Connect, id, session.modules_mut());
        debug!(
            session = %id,
            logical_id = %session.logical_id,
            "New session from {}, {} connect module(s) loaded",
            peer,
            report.activated.len()
        );

        spawn_session_task(
            SessionTask {
                id,
                target,
                connect_timeout: self.timeouts.upstream_connect(),
                connector: Arc::clone(&self.connector),
                engine: Arc::clone(&self.engine),
                params: self.params.clone(),
                events: self.events_tx.clone(),
                close: session.close_token(),
            },
            stream,
        );

        counter!("proxy_sessions_total").increment(1);
        self.live_tasks.insert(id);
        self.pending.insert(id, session);
    }

    fn on_session_signal(&mut self, id: SessionId, signal: SessionSignal) {
        match signal {
            SessionSignal::UpstreamConnected { upstream_addr } => self.on_upstream_connected(id, upstream_addr),
            SessionSignal::UpstreamFailed(e) => self.on_upstream_failed(id, e),
            SessionSignal::HandshakeComplete => self.on_handshake_complete(id),
            SessionSignal::Ended(e) => self.on_session_ended(id, e),
        }
    }

    fn on_upstream_connected(&mut self, id: SessionId, upstream_addr: SocketAddr) {
        let Some(mut session) = self.pending.remove(&id) else {
            debug!(session = %id, "Upstream connected for unknown session");
            return;
        };

        session.apply(SessionEvent::UpstreamConnected);
        session.upstream_addr = Some(upstream_addr);
        let routed = SessionNotice::Routed {
            downstream: session.downstream_addr,
            upstream: upstream_addr,
        };
        session.modules_mut().notify(&routed);
        info!(session = %id, "[proxy] routing {} to {}", session.downstream_addr, upstream_addr);

        self.sessions.insert(id, session);
        gauge!("proxy_active_sessions").set(self.sessions.len() as f64);
    }

    fn on_upstream_failed(&mut self, id: SessionId, e: io::Error) {
        self.live_tasks.remove(&id);

        let Some(mut session) = self.pending.remove(&id) else {
            debug!(session = %id, "Upstream failure for unknown session: {}", e);
            return;
        };

        let failure = ConnectionFailure::report(&e, &session.target.to_string());
        self.record_failure(failure);

        session.apply(SessionEvent::UpstreamFailed);
        session.purge();
        info!(session = %id, "[proxy] {} could not be routed to {}", session.downstream_addr, session.target);
    }

    fn record_failure(&mut self, failure: ConnectionFailure) {
        counter!("proxy_upstream_failures_total", "kind" => failure.as_str()).increment(1);
        *self.failures.entry(failure).or_default() += 1;
    }

    fn on_handshake_complete(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            debug!(session = %id, "Handshake completed for unknown session");
            return;
        };

        let report = self.loader.activate(ActivationPass::VersionCheck, id, session.modules_mut());
        session.modules_mut().notify(&SessionNotice::HandshakeComplete);
        debug!(session = %id, "Handshake complete, {} module(s) loaded", report.activated.len());
    }

    fn on_session_ended(&mut self, id: SessionId, error: Option<io::Error>) {
        self.live_tasks.remove(&id);

        let Some(mut session) = self.sessions.remove(&id).or_else(|| self.pending.remove(&id)) else {
            return;
        };

        match &error {
            Some(e) => {
                let failure = ConnectionFailure::report(e, &session.target.to_string());
                self.record_failure(failure);
                session.apply(SessionEvent::SocketError);
            }
            None => {
                session.apply(SessionEvent::UpstreamClosed);
            }
        }

        session.modules_mut().notify(&SessionNotice::Closing);
        session.purge();
        info!(
            session = %id,
            "[proxy] {} disconnected after {}s",
            session.downstream_addr,
            session.age().num_seconds()
        );
        gauge!("proxy_active_sessions").set(self.sessions.len() as f64);
    }

    fn on_process(&mut self, presence: ProcessPresence) {
        if self.is_draining() || self.region.profile.is_direct() {
            return;
        }

        match presence {
            ProcessPresence::Detected { pid } => {
                info!("[proxy] game client detected (pid {})", pid);
                match self.redirection.on_process_detected() {
                    Ok(()) => gauge!("proxy_redirection_enabled").set(1.0),
                    Err(e) => {
                        error!("ERROR: Unable to redirect the server list: {}", e);
                        for hint in e.remediation() {
                            error!("{}", hint);
                        }
                        self.begin_shutdown(ShutdownReason::RedirectionFailure);
                    }
                }
            }
            ProcessPresence::Lost { pid } => {
                info!("[proxy] game client exited (pid {})", pid);
                if let Err(e) = self.redirection.on_process_lost() {
                    warn!("Unable to revert the server list redirection: {}", e);
                    for hint in e.remediation() {
                        warn!("{}", hint);
                    }
                }
                gauge!("proxy_redirection_enabled").set(0.0);
            }
        }
    }

    fn on_auto_revert(&mut self, generation: u64) {
        match self.redirection.on_auto_revert(generation) {
            Ok(true) => gauge!("proxy_redirection_enabled").set(0.0),
            Ok(false) => {}
            Err(e) => {
                warn!("Unable to revert the server list redirection: {}", e);
                for hint in e.remediation() {
                    warn!("{}", hint);
                }
                gauge!("proxy_redirection_enabled").set(0.0);
            }
        }
    }

    fn drain_complete(&self) -> Option<ExitReason> {
        let reason = self.shutdown.reason()?;
        if self.live_tasks.is_empty() {
            info!("[proxy] all sessions closed");
            Some(ExitReason::Drained(reason))
        } else {
            None
        }
    }
}

/// Port component of a `host:port` bind address
fn port_of(addr: &str) -> Option<u16> {
    addr.rsplit(':').next()?.parse().ok()
}
