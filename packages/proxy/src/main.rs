// packages/proxy/src/main.rs
//! Game Interception Proxy
//!
//! Redirects the game client's server list to local listeners and relays
//! every game connection through per-session plugin modules.

use anyhow::Result;
use game_proxy::interception::hosts_file::HostsFile;
use game_proxy::modules::{builtin_catalog, LocalModuleScanner, ModuleUpdater};
use game_proxy::observability::{init_metrics, init_tracing};
use game_proxy::orchestrator::signals::spawn_signal_listener;
use game_proxy::orchestrator::{Orchestrator, OrchestratorDeps};
use game_proxy::routing::directory::{DirectoryClient, DirectoryResolver, HttpDirectoryClient};
use game_proxy::runtime::process_monitor::SysinfoProbe;
use game_proxy::session::engine::{PassthroughEngine, TcpConnector};
use game_proxy::utils::config::ProxyConfig;
use game_proxy::{BuildInfo, ProxyError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn report_fatal(e: &ProxyError) {
    error!("ERROR: {}", e);
    for hint in e.hints() {
        error!("{}", hint);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize observability (tracing, logging)
    init_tracing()?;

    let build = BuildInfo::current();
    info!(
        "Starting game proxy v{} ({}, built {} with {})",
        build.version, build.git_hash, build.build_timestamp, build.rustc_version
    );

    // Load configuration
    let config = match ProxyConfig::load() {
        Ok(config) => config,
        Err(e) => {
            report_fatal(&e);
            std::process::exit(1);
        }
    };
    init_metrics(config.metrics_addr.as_deref())?;

    let region = config.region()?;
    info!("Region {} ({})", region.name, region.short_code);

    // Scan modules once, before anything binds
    let scanner = LocalModuleScanner::new(&config.paths.module_dir, config.update_log);
    let snapshot = match scanner.update().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            report_fatal(&e);
            std::process::exit(1);
        }
    };

    let client: Option<Box<dyn DirectoryClient>> = match region.profile.directory_url.as_deref() {
        Some(url) if !region.profile.is_direct() => Some(Box::new(HttpDirectoryClient::new(
            url,
            &config.dns_servers,
            region.profile.directory_port,
        )?)),
        _ => None,
    };
    let directory = DirectoryResolver::for_profile(&region.profile, client)?;

    let hosts = match &config.paths.hosts_file {
        Some(path) => HostsFile::new(path),
        None => HostsFile::system(),
    };

    let mut orchestrator = Orchestrator::new(OrchestratorDeps {
        region,
        timeouts: config.timeouts.clone(),
        process_name: config.process_name.clone(),
        hosts: Box::new(hosts),
        directory,
        probe: Box::new(SysinfoProbe::new()),
        connector: Arc::new(TcpConnector),
        engine: Arc::new(PassthroughEngine),
        catalog: Arc::new(builtin_catalog()),
        snapshot: Arc::new(snapshot),
    });

    // Startup failures are fatal; dropping the orchestrator closes whatever was bound
    if let Err(e) = orchestrator.start().await {
        report_fatal(&e);
        drop(orchestrator);
        std::process::exit(1);
    }

    let signals = CancellationToken::new();
    spawn_signal_listener(orchestrator.sender(), signals.clone());

    let exit = orchestrator.run().await;
    signals.cancel();
    info!("Proxy stopped: {:?}", exit);

    // Session tasks may still hold sockets after a forced exit
    std::process::exit(exit.exit_code());
}
