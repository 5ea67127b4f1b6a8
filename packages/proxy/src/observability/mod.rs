// packages/proxy/src/observability/mod.rs
//! Logging and metrics setup
//!
//! - `RUST_LOG` selects the filter (default `info`)
//! - `PROXY_LOG_FORMAT=json` switches to JSON lines
//! - metrics are exported for Prometheus when `metrics_addr` is configured

use crate::utils::errors::{ProxyError, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PROXY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };

    result.map_err(|e| ProxyError::RuntimeError(format!("Failed to initialize tracing: {}", e)))
}

/// Register metric descriptions and start the exporter if `addr` is set
pub fn init_metrics(addr: Option<&str>) -> Result<()> {
    let Some(addr) = addr else {
        describe_metrics();
        return Ok(());
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| ProxyError::ConfigError(format!("Invalid metrics address {}: {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| ProxyError::RuntimeError(format!("Failed to start metrics exporter: {}", e)))?;

    describe_metrics();
    info!("Metrics available on http://{}/metrics", addr);
    Ok(())
}

fn describe_metrics() {
    describe_counter!("proxy_sessions_total", "Client connections accepted");
    describe_gauge!("proxy_active_sessions", "Sessions with a live upstream");
    describe_counter!(
        "proxy_upstream_failures_total",
        "Session failures by category"
    );
    describe_gauge!(
        "proxy_redirection_enabled",
        "1 while the server list hostnames are redirected"
    );
}
