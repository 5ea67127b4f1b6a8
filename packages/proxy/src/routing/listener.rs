// packages/proxy/src/routing/listener.rs
//! Local listener provisioning
//!
//! One TCP listener per logical server id that has both a local port in the
//! region profile and a resolved upstream target. Every accepted connection
//! is forwarded to the orchestrator tagged with the listener's target.

use crate::orchestrator::events::{EventSender, ProxyEvent};
use crate::routing::region::{RegionProfile, ServerTarget, TargetMap};
use crate::utils::errors::{ProxyError, Result};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Listener to bind for one logical server id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerPlan {
    pub logical_id: String,
    pub bind_addr: String,
    pub target: ServerTarget,
}

/// Match profile listeners against resolved targets
///
/// Returns the plans in logical id order plus the ids that could not be
/// resolved. Each unresolved id is logged once.
pub fn plan_listeners(profile: &RegionProfile, targets: &TargetMap) -> (Vec<ListenerPlan>, Vec<String>) {
    let mut plans = Vec::new();
    let mut missing = Vec::new();

    for (id, spec) in &profile.custom_servers {
        match targets.get(id) {
            Some(target) => plans.push(ListenerPlan {
                logical_id: id.clone(),
                bind_addr: spec.bind_addr(),
                target: target.clone(),
            }),
            None => {
                warn!("WARNING: Server {} not found", id);
                missing.push(id.clone());
            }
        }
    }

    (plans, missing)
}

/// Map a bind error to its startup-fatal category
pub fn classify_bind_error(addr: &str, e: io::Error) -> ProxyError {
    match e.kind() {
        io::ErrorKind::AddrInUse => ProxyError::AddressInUse {
            addr: addr.to_string(),
        },
        io::ErrorKind::PermissionDenied => ProxyError::BindPermissionDenied {
            addr: addr.to_string(),
        },
        _ => ProxyError::BindFailed {
            addr: addr.to_string(),
            source: e,
        },
    }
}

/// A bound listener and its accept loop
pub struct ListenerHandle {
    pub logical_id: String,
    pub local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl ListenerHandle {
    /// Stop accepting; returns `false` if already closed
    pub fn close(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        debug!("Closed listener {} on {}", self.logical_id, self.local_addr);
        true
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Bind one listener and start its accept loop
pub async fn provision(plan: ListenerPlan, events: EventSender) -> Result<ListenerHandle> {
    let listener = TcpListener::bind(&plan.bind_addr)
        .await
        .map_err(|e| classify_bind_error(&plan.bind_addr, e))?;
    let local_addr = listener.local_addr()?;

    info!(
        "[proxy] listening on {} for server {} ({})",
        local_addr, plan.logical_id, plan.target
    );

    let cancel = CancellationToken::new();
    tokio::spawn(accept_loop(
        listener,
        plan.logical_id.clone(),
        plan.target.clone(),
        events,
        cancel.clone(),
    ));

    Ok(ListenerHandle {
        logical_id: plan.logical_id,
        local_addr,
        cancel,
    })
}

/// Bind every planned listener; on failure the ones already bound are closed
pub async fn provision_all(plans: Vec<ListenerPlan>, events: &EventSender) -> Result<Vec<ListenerHandle>> {
    let mut handles: Vec<ListenerHandle> = Vec::with_capacity(plans.len());

    for plan in plans {
        match provision(plan, events.clone()).await {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                for handle in &handles {
                    handle.close();
                }
                return Err(e);
            }
        }
    }

    Ok(handles)
}

async fn accept_loop(
    listener: TcpListener,
    logical_id: String,
    target: ServerTarget,
    events: EventSender,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {} on server {}", peer, logical_id);
                    let event = ProxyEvent::Accepted {
                        logical_id: logical_id.clone(),
                        target: target.clone(),
                        stream,
                        peer,
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to accept connection on server {}: {}", logical_id, e);
                    accept_backoff().await;
                }
            }
        }
    }

    debug!("Accept loop for server {} stopped", logical_id);
}

/// Pause after a failed accept so persistent errors such as EMFILE do not spin
pub(crate) async fn accept_backoff() {
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// Log which process holds `port`
pub async fn report_port_owner(port: u16) {
    let mut command = if cfg!(windows) {
        let mut c = tokio::process::Command::new("netstat");
        c.arg("-ano");
        c
    } else {
        let mut c = tokio::process::Command::new("ss");
        c.arg("-ltnp");
        c
    };

    let output = match command.output().await {
        Ok(output) => output,
        Err(e) => {
            debug!("Unable to inspect port owner: {}", e);
            return;
        }
    };

    let needle = format!(":{}", port);
    let text = String::from_utf8_lossy(&output.stdout);
    let owners = port_owner_lines(&text, &needle);
    if owners.is_empty() {
        info!("No process found listening on port {}", port);
    }
    for line in owners {
        info!("Port {} in use: {}", port, line);
    }
}

fn port_owner_lines<'a>(text: &'a str, needle: &str) -> Vec<&'a str> {
    text.lines()
        .map(str::trim)
        .filter(|line| {
            line.split_whitespace()
                .any(|field| field.ends_with(needle))
        })
        .collect()
}
