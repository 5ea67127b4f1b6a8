// packages/proxy/src/orchestrator/shutdown.rs
//! Shutdown coordination
//!
//! Drain order:
//! 1. close the upstream of every active session
//! 2. purge residual registry entries and cancel connecting sessions
//! 3. revert host redirection (best effort)
//! 4. close the directory client
//! 5. close every listener
//! 6. arm the grace timer that forces exit
//!
//! No step can prevent a later one from running. The drain runs at most once.

use crate::interception::redirection::HostRedirection;
use crate::orchestrator::events::{EventSender, ProxyEvent, ShutdownReason};
use crate::routing::directory::DirectoryResolver;
use crate::routing::listener::ListenerHandle;
use crate::session::proxy_session::{ProxySession, SessionId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// What a drain has to release
pub struct DrainTargets<'a> {
    pub sessions: &'a mut HashMap<SessionId, ProxySession>,
    pub pending: &'a mut HashMap<SessionId, ProxySession>,
    pub redirection: &'a mut HostRedirection,
    pub directory: &'a mut DirectoryResolver,
    pub listeners: &'a mut Vec<ListenerHandle>,
}

/// Summary of one drain
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Active sessions asked to close
    pub closed_sessions: usize,
    /// Registry entries purged, connecting sessions included
    pub purged_sessions: usize,
    pub closed_listeners: usize,
}

/// Runs the drain sequence once and owns the grace timer
pub struct ShutdownCoordinator {
    grace: Duration,
    events: EventSender,
    reason: Option<ShutdownReason>,
    grace_timer: Option<JoinHandle<()>>,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration, events: EventSender) -> Self {
        Self {
            grace,
            events,
            reason: None,
            grace_timer: None,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.reason.is_some()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason
    }

    /// Drain everything; returns `None` if a drain already ran
    pub fn drain(&mut self, reason: ShutdownReason, targets: DrainTargets<'_>) -> Option<DrainReport> {
        if let Some(first) = self.reason {
            debug!("Ignoring {} while draining after {}", reason, first);
            return None;
        }
        self.reason = Some(reason);
        info!("[proxy] shutting down ({})", reason);

        let DrainTargets {
            sessions,
            pending,
            redirection,
            directory,
            listeners,
        } = targets;
        let mut report = DrainReport::default();

        for session in sessions.values_mut() {
            session.request_close();
            report.closed_sessions += 1;
        }

        for (_, mut session) in sessions.drain().chain(pending.drain()) {
            session.request_close();
            session.purge();
            report.purged_sessions += 1;
        }

        redirection.shutdown_revert();

        directory.close();

        for listener in listeners.drain(..) {
            if listener.close() {
                report.closed_listeners += 1;
            }
        }

        self.arm_grace_timer();

        info!(
            "[proxy] drained {} sessions and {} listeners",
            report.purged_sessions, report.closed_listeners
        );
        Some(report)
    }

    fn arm_grace_timer(&mut self) {
        let grace = self.grace;
        let events = self.events.clone();
        self.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(ProxyEvent::GraceElapsed);
        }));
        debug!("Forced exit in {:?}", grace);
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::redirection::tests::MemoryHosts;
    use crate::orchestrator::events;
    use crate::routing::region::{ServerTarget, TargetMap};
    use crate::session::proxy_session::{SessionEvent, SessionState};

    fn session() -> ProxySession {
        ProxySession::new(
            "4004",
            ServerTarget::new("10.0.0.1", 7801),
            "127.0.0.1:50000".parse().unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_runs_once_and_arms_grace_timer() {
        let (tx, mut rx) = events::channel();
        let hosts = MemoryHosts::default();
        let mut redirection = HostRedirection::new(
            Box::new(hosts.clone()),
            "127.0.0.2",
            vec!["sls.example.com".to_string()],
            Duration::from_secs(120),
            tx.clone(),
        );
        redirection.on_process_detected().unwrap();
        assert_eq!(hosts.applied(), 1);

        let mut directory = DirectoryResolver::Static(TargetMap::new());
        let mut listeners = Vec::new();

        let mut active = session();
        active.apply(SessionEvent::UpstreamConnected);
        let active_token = active.close_token();
        let connecting = session();
        let connecting_token = connecting.close_token();

        let mut sessions = HashMap::from([(active.id, active)]);
        let mut pending = HashMap::from([(connecting.id, connecting)]);

        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5), tx);
        let report = coordinator
            .drain(
                ShutdownReason::Terminate,
                DrainTargets {
                    sessions: &mut sessions,
                    pending: &mut pending,
                    redirection: &mut redirection,
                    directory: &mut directory,
                    listeners: &mut listeners,
                },
            )
            .unwrap();

        assert_eq!(report.closed_sessions, 1);
        assert_eq!(report.purged_sessions, 2);
        assert!(sessions.is_empty() && pending.is_empty());
        assert!(active_token.is_cancelled() && connecting_token.is_cancelled());
        assert_eq!(hosts.applied(), 0);
        assert!(coordinator.is_draining());

        let second = coordinator.drain(
            ShutdownReason::Interrupt,
            DrainTargets {
                sessions: &mut sessions,
                pending: &mut pending,
                redirection: &mut redirection,
                directory: &mut directory,
                listeners: &mut listeners,
            },
        );
        assert!(second.is_none());
        assert_eq!(coordinator.reason(), Some(ShutdownReason::Terminate));

        // Auto-revert timer was cancelled by the drain, so the next event is the grace timer
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(rx.recv().await, Some(ProxyEvent::GraceElapsed)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closing_state_after_request() {
        let mut s = session();
        s.apply(SessionEvent::UpstreamConnected);
        s.request_close();
        assert_eq!(s.state(), SessionState::Closing);
        s.purge();
        assert_eq!(s.state(), SessionState::Closed);
    }
}
