// packages/proxy/src/interception/redirection.rs
//! Host redirection state machine
//!
//! ```text
//!            processDetected (re-arms timer)
//!              ┌──────────────┐
//!              ▼              │
//! Disabled ──processDetected──► Enabled
//!    ▲                          │
//!    └── processLost / autoRevertTimerFires(current generation)
//! ```
//!
//! The auto-revert timer is a fallback for a missed `processLost`. Each armed
//! timer carries a generation number; an expiry for any generation other
//! than the currently armed one is ignored, so a reset timer can never revert
//! redirection that a newer detection re-established.

use crate::interception::hosts_file::{HostsError, HostsStore};
use crate::orchestrator::events::{EventSender, ProxyEvent};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Whether redirection entries are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectionState {
    Disabled,
    Enabled,
}

struct ArmedTimer {
    generation: u64,
    task: JoinHandle<()>,
}

/// Toggles hosts entries for the region's hostnames
pub struct HostRedirection {
    store: Box<dyn HostsStore>,
    listen_hostname: String,
    hostnames: Vec<String>,
    auto_revert: Duration,
    events: EventSender,
    state: RedirectionState,
    timer: Option<ArmedTimer>,
    generation: u64,
}

impl HostRedirection {
    pub fn new(
        store: Box<dyn HostsStore>,
        listen_hostname: impl Into<String>,
        hostnames: Vec<String>,
        auto_revert: Duration,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            listen_hostname: listen_hostname.into(),
            hostnames,
            auto_revert,
            events,
            state: RedirectionState::Disabled,
            timer: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> RedirectionState {
        self.state
    }

    /// Number of pending auto-revert timers (0 or 1)
    pub fn armed_timers(&self) -> usize {
        self.timer
            .as_ref()
            .map_or(0, |timer| usize::from(!timer.task.is_finished()))
    }

    /// Remove stale entries left by a previous run
    pub fn reset_baseline(&mut self) -> Result<(), HostsError> {
        self.cancel_timer();
        self.remove_entries()?;
        self.state = RedirectionState::Disabled;
        info!("[sls] server list overridden reverted");
        Ok(())
    }

    /// Game client appeared: apply entries and re-arm the auto-revert timer
    pub fn on_process_detected(&mut self) -> Result<(), HostsError> {
        self.cancel_timer();

        for (applied, hostname) in self.hostnames.iter().enumerate() {
            if let Err(e) = self.store.set(&self.listen_hostname, hostname) {
                // Roll back what was applied so state and file agree
                for done in &self.hostnames[..applied] {
                    let _ = self.store.remove(&self.listen_hostname, done);
                }
                self.state = RedirectionState::Disabled;
                return Err(e);
            }
        }

        self.state = RedirectionState::Enabled;
        self.arm_timer();
        info!("[sls] server list overridden");
        Ok(())
    }

    /// Game client exited
    pub fn on_process_lost(&mut self) -> Result<(), HostsError> {
        self.cancel_timer();
        let result = self.remove_entries();
        self.state = RedirectionState::Disabled;
        if result.is_ok() {
            info!("[sls] server list overridden reverted");
        }
        result
    }

    /// Auto-revert timer expired
    ///
    /// Returns `Ok(false)` when the expiry belongs to a timer that has since
    /// been replaced or cancelled.
    pub fn on_auto_revert(&mut self, generation: u64) -> Result<bool, HostsError> {
        match &self.timer {
            Some(timer) if timer.generation == generation => {}
            _ => {
                debug!("Ignoring stale auto-revert timer #{}", generation);
                return Ok(false);
            }
        }

        self.timer = None;
        let result = self.remove_entries();
        self.state = RedirectionState::Disabled;
        result?;
        info!("[sls] server list overridden reverted (auto-revert)");
        Ok(true)
    }

    /// Best-effort revert during shutdown
    pub fn shutdown_revert(&mut self) {
        self.cancel_timer();

        if self.state == RedirectionState::Enabled {
            if let Err(e) = self.remove_entries() {
                warn!("Failed to revert host redirection during shutdown: {}", e);
            } else {
                info!("[sls] server list overridden reverted");
            }
        }

        self.state = RedirectionState::Disabled;
    }

    fn remove_entries(&mut self) -> Result<(), HostsError> {
        let mut first_error = None;
        for hostname in &self.hostnames {
            if let Err(e) = self.store.remove(&self.listen_hostname, hostname) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn arm_timer(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let delay = self.auto_revert;
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ProxyEvent::AutoRevertElapsed { generation });
        });

        debug!("Armed auto-revert timer #{} ({:?})", generation, delay);
        self.timer = Some(ArmedTimer { generation, task });
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.task.abort();
            debug!("Cancelled auto-revert timer #{}", timer.generation);
        }
    }
}

impl Drop for HostRedirection {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::interception::hosts_file::HostsErrorKind;
    use crate::orchestrator::events::{self, EventReceiver};
    use std::collections::BTreeSet;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// In-memory hosts store shared with the test body
    #[derive(Clone, Default)]
    pub(crate) struct MemoryHosts {
        pub entries: Arc<Mutex<BTreeSet<(String, String)>>>,
        pub fail_set: Arc<Mutex<Option<String>>>,
        pub fail_remove: Arc<Mutex<bool>>,
    }

    impl MemoryHosts {
        pub fn applied(&self) -> usize {
            self.entries.lock().unwrap().len()
        }
    }

    impl HostsStore for MemoryHosts {
        fn set(&mut self, listen_hostname: &str, hostname: &str) -> Result<(), HostsError> {
            if self.fail_set.lock().unwrap().as_deref() == Some(hostname) {
                return Err(HostsError::new(
                    std::path::Path::new("memory"),
                    io::Error::from(io::ErrorKind::PermissionDenied),
                ));
            }
            self.entries
                .lock()
                .unwrap()
                .insert((listen_hostname.to_string(), hostname.to_string()));
            Ok(())
        }

        fn remove(&mut self, listen_hostname: &str, hostname: &str) -> Result<(), HostsError> {
            if *self.fail_remove.lock().unwrap() {
                return Err(HostsError::new(
                    std::path::Path::new("memory"),
                    io::Error::from(io::ErrorKind::PermissionDenied),
                ));
            }
            self.entries
                .lock()
                .unwrap()
                .remove(&(listen_hostname.to_string(), hostname.to_string()));
            Ok(())
        }
    }

    fn redirection(hosts: &MemoryHosts) -> (HostRedirection, EventReceiver) {
        let (tx, rx) = events::channel();
        let redirection = HostRedirection::new(
            Box::new(hosts.clone()),
            "127.0.0.2",
            vec!["sls.example.com".to_string(), "sls2.example.com".to_string()],
            Duration::from_secs(120),
            tx,
        );
        (redirection, rx)
    }

    /// Feed the next timer expiry back into the state machine
    async fn deliver_expiry(redirection: &mut HostRedirection, rx: &mut EventReceiver) -> bool {
        match rx.recv().await {
            Some(ProxyEvent::AutoRevertElapsed { generation }) => {
                redirection.on_auto_revert(generation).unwrap()
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_baseline_removes_stale_entries() {
        let hosts = MemoryHosts::default();
        hosts
            .entries
            .lock()
            .unwrap()
            .insert(("127.0.0.2".to_string(), "sls.example.com".to_string()));

        let (mut redirection, _rx) = redirection(&hosts);
        redirection.reset_baseline().unwrap();

        assert_eq!(hosts.applied(), 0);
        assert_eq!(redirection.state(), RedirectionState::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_then_lose() {
        let hosts = MemoryHosts::default();
        let (mut redirection, _rx) = redirection(&hosts);

        redirection.on_process_detected().unwrap();
        assert_eq!(redirection.state(), RedirectionState::Enabled);
        assert_eq!(hosts.applied(), 2);
        assert_eq!(redirection.armed_timers(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;

        redirection.on_process_lost().unwrap();
        assert_eq!(redirection.state(), RedirectionState::Disabled);
        assert_eq!(hosts.applied(), 0);
        assert_eq!(redirection.armed_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_detection_keeps_single_timer() {
        let hosts = MemoryHosts::default();
        let (mut redirection, mut rx) = redirection(&hosts);

        for _ in 0..5 {
            redirection.on_process_detected().unwrap();
            assert_eq!(redirection.armed_timers(), 1);
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        // 300s have passed since the first detection, but only 60s since the last
        assert_eq!(redirection.state(), RedirectionState::Enabled);
        assert!(rx.try_recv().is_err());

        assert!(deliver_expiry(&mut redirection, &mut rx).await);
        assert_eq!(redirection.state(), RedirectionState::Disabled);
        assert_eq!(hosts.applied(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_revert_fires_once() {
        let hosts = MemoryHosts::default();
        let (mut redirection, mut rx) = redirection(&hosts);

        redirection.on_process_detected().unwrap();
        tokio::time::sleep(Duration::from_secs(121)).await;

        assert!(deliver_expiry(&mut redirection, &mut rx).await);
        assert_eq!(redirection.state(), RedirectionState::Disabled);
        assert_eq!(hosts.applied(), 0);
        assert_eq!(redirection.armed_timers(), 0);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_ignored() {
        let hosts = MemoryHosts::default();
        let (mut redirection, _rx) = redirection(&hosts);

        redirection.on_process_detected().unwrap();
        redirection.on_process_detected().unwrap();

        // Generation 1 was replaced by generation 2
        assert!(!redirection.on_auto_revert(1).unwrap());
        assert_eq!(redirection.state(), RedirectionState::Enabled);
        assert_eq!(hosts.applied(), 2);
    }

    #[tokio::test]
    async fn test_failed_apply_rolls_back() {
        let hosts = MemoryHosts::default();
        *hosts.fail_set.lock().unwrap() = Some("sls2.example.com".to_string());
        let (mut redirection, _rx) = redirection(&hosts);

        let err = redirection.on_process_detected().unwrap_err();
        assert_eq!(err.kind, HostsErrorKind::PermissionDenied);
        assert_eq!(redirection.state(), RedirectionState::Disabled);
        assert_eq!(hosts.applied(), 0);
        assert_eq!(redirection.armed_timers(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_revert_swallows_errors() {
        let hosts = MemoryHosts::default();
        let (mut redirection, _rx) = redirection(&hosts);

        redirection.on_process_detected().unwrap();
        *hosts.fail_remove.lock().unwrap() = true;

        redirection.shutdown_revert();
        assert_eq!(redirection.state(), RedirectionState::Disabled);
        assert_eq!(redirection.armed_timers(), 0);
    }
}
