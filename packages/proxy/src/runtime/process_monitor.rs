// packages/proxy/src/runtime/process_monitor.rs
//! Game client process monitor
//!
//! Polls the process table for an executable name and reports presence
//! changes to the orchestrator:
//! - `Detected` for every newly appearing PID
//! - `Lost` for every PID that disappeared since the last poll

use crate::orchestrator::events::{EventSender, ProxyEvent};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Presence change of the watched process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPresence {
    Detected { pid: u32 },
    Lost { pid: u32 },
}

/// Source of running PIDs for an executable name
pub trait ProcessProbe: Send {
    fn matching_pids(&mut self, name: &str) -> HashSet<u32>;
}

/// Probe backed by `sysinfo`
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn matching_pids(&mut self, name: &str) -> HashSet<u32> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        self.system
            .processes_by_exact_name(OsStr::new(name))
            .map(|process| process.pid().as_u32())
            .collect()
    }
}

/// Presence changes between two polls, detections first
pub fn presence_changes(previous: &HashSet<u32>, current: &HashSet<u32>) -> Vec<ProcessPresence> {
    let mut detected: Vec<u32> = current.difference(previous).copied().collect();
    let mut lost: Vec<u32> = previous.difference(current).copied().collect();
    detected.sort_unstable();
    lost.sort_unstable();

    detected
        .into_iter()
        .map(|pid| ProcessPresence::Detected { pid })
        .chain(lost.into_iter().map(|pid| ProcessPresence::Lost { pid }))
        .collect()
}

/// Polling process monitor
pub struct ProcessMonitor {
    process_name: String,
    poll_interval: Duration,
    probe: Box<dyn ProcessProbe>,
}

impl ProcessMonitor {
    pub fn new(
        process_name: impl Into<String>,
        poll_interval: Duration,
        probe: Box<dyn ProcessProbe>,
    ) -> Self {
        Self {
            process_name: process_name.into(),
            poll_interval,
            probe,
        }
    }

    /// Start polling until `cancel` fires
    pub fn start(self, events: EventSender, cancel: CancellationToken) -> JoinHandle<()> {
        let Self {
            process_name,
            poll_interval,
            mut probe,
        } = self;

        info!("Watching for process {} every {:?}", process_name, poll_interval);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            let mut seen = HashSet::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                // Process table scans block, keep them off the async workers
                let name = process_name.clone();
                let polled = tokio::task::spawn_blocking(move || {
                    let pids = probe.matching_pids(&name);
                    (probe, pids)
                })
                .await;

                let current = match polled {
                    Ok((returned, pids)) => {
                        probe = returned;
                        pids
                    }
                    Err(e) => {
                        warn!("Process probe failed, stopping monitor: {}", e);
                        break;
                    }
                };

                for change in presence_changes(&seen, &current) {
                    debug!("Process {} presence change: {:?}", process_name, change);
                    if events.send(ProxyEvent::Process(change)).is_err() {
                        return;
                    }
                }
                seen = current;
            }

            debug!("Process monitor for {} stopped", process_name);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::events;
    use std::collections::VecDeque;

    struct ScriptedProbe {
        polls: VecDeque<Vec<u32>>,
    }

    impl ProcessProbe for ScriptedProbe {
        fn matching_pids(&mut self, _name: &str) -> HashSet<u32> {
            self.polls
                .pop_front()
                .unwrap_or_default()
                .into_iter()
                .collect()
        }
    }

    #[test]
    fn test_presence_changes() {
        let previous: HashSet<u32> = [1, 2].into_iter().collect();
        let current: HashSet<u32> = [2, 3].into_iter().collect();

        assert_eq!(
            presence_changes(&previous, &current),
            vec![
                ProcessPresence::Detected { pid: 3 },
                ProcessPresence::Lost { pid: 1 },
            ]
        );
        assert!(presence_changes(&current, &current).is_empty());
    }

    #[tokio::test]
    async fn test_monitor_reports_changes() {
        let probe = ScriptedProbe {
            polls: VecDeque::from(vec![vec![], vec![42], vec![42], vec![]]),
        };
        let monitor = ProcessMonitor::new("Game.exe", Duration::from_millis(5), Box::new(probe));
        let (tx, mut rx) = events::channel();
        let cancel = CancellationToken::new();
        let handle = monitor.start(tx, cancel.clone());

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ProxyEvent::Process(ProcessPresence::Detected { pid: 42 })));

        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ProxyEvent::Process(ProcessPresence::Lost { pid: 42 })));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_sysinfo_probe_finds_nothing_for_bogus_name() {
        let mut probe = SysinfoProbe::new();
        assert!(probe.matching_pids("definitely-not-a-real-process.exe").is_empty());
    }
}
