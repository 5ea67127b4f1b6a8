// packages/proxy/src/orchestrator/signals.rs
//! OS signal listeners
//!
//! Every delivery of SIGINT (Ctrl-C), SIGTERM or SIGHUP becomes a
//! `ShutdownRequested` event. Repeated deliveries are forwarded as well; the
//! shutdown coordinator ignores them once a drain is running.

use crate::orchestrator::events::{EventSender, ProxyEvent, ShutdownReason};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(unix)]
type SignalStream = Option<tokio::signal::unix::Signal>;

#[cfg(not(unix))]
type SignalStream = ();

#[cfg(unix)]
fn install(kind: tokio::signal::unix::SignalKind, name: &str) -> SignalStream {
    tokio::signal::unix::signal(kind)
        .map_err(|e| warn!("Failed to install {} handler: {}", name, e))
        .ok()
}

/// Wait for the next delivery; never resolves if the stream is unavailable
#[cfg(unix)]
async fn next_delivery(stream: &mut SignalStream) {
    if let Some(stream) = stream.as_mut() {
        if stream.recv().await.is_some() {
            return;
        }
    }
    std::future::pending::<()>().await;
}

#[cfg(not(unix))]
async fn next_delivery(_stream: &mut SignalStream) {
    std::future::pending::<()>().await;
}

/// Forward shutdown signals to the orchestrator until `cancel` fires
pub fn spawn_signal_listener(events: EventSender, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let (mut term, mut hup) = {
            use tokio::signal::unix::SignalKind;
            (
                install(SignalKind::terminate(), "SIGTERM"),
                install(SignalKind::hangup(), "SIGHUP"),
            )
        };
        #[cfg(not(unix))]
        let (mut term, mut hup): (SignalStream, SignalStream) = ((), ());

        loop {
            let reason = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => ShutdownReason::Interrupt,
                    Err(e) => {
                        warn!("Failed to listen for Ctrl-C: {}", e);
                        break;
                    }
                },
                _ = next_delivery(&mut term) => ShutdownReason::Terminate,
                _ = next_delivery(&mut hup) => ShutdownReason::Hangup,
            };

            info!("Received {}", reason);
            if events.send(ProxyEvent::ShutdownRequested(reason)).is_err() {
                break;
            }
        }

        debug!("Signal listener stopped");
    })
}
