//! dnslb binary: load the configuration, wire the runtime, run the loops.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dnslb::backend::server::spawn_responders;
use dnslb::config::{load_config, ListenerProtocol};
use dnslb::engine::QueryEngine;
use dnslb::frontend::{Frontend, FrontendKind, TcpFrontend, UdpFrontend};
use dnslb::metrics::EngineStats;
use dnslb::runtime::{run_health_checks, run_maintenance};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let Some(config_path) = std::env::args().nth(1) else {
        eprintln!("usage: dnslb <config.json>");
        return ExitCode::FAILURE;
    };

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %config_path, "configuration rejected");
            return ExitCode::FAILURE;
        }
    };

    let (runtime, backends) = match config.build_runtime() {
        Ok(built) => built,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };
    let stats = Arc::new(EngineStats::new());
    let engine = QueryEngine::new(Arc::clone(&runtime), Arc::clone(&stats));

    for backend in &backends {
        if let Err(e) = backend.connect() {
            // a dead backend at startup is the health checker's problem,
            // not a startup failure
            warn!(backend = %backend.name_with_addr(), error = %e, "initial connect failed");
        }
        spawn_responders(backend, &engine);
    }

    for listener in &config.listeners {
        let kind = match listener.protocol {
            ListenerProtocol::Udp => FrontendKind::Udp,
            ListenerProtocol::Tcp => FrontendKind::Tcp,
        };
        let frontend = Frontend::with_muted(listener.address, kind, listener.muted);
        match listener.protocol {
            ListenerProtocol::Udp => {
                let udp = match UdpFrontend::bind(frontend, engine.clone()).await {
                    Ok(udp) => udp,
                    Err(e) => {
                        error!(addr = %listener.address, error = %e, "UDP bind failed");
                        return ExitCode::FAILURE;
                    }
                };
                tokio::spawn(async move { udp.run().await });
            }
            ListenerProtocol::Tcp => {
                let tcp = match TcpFrontend::bind(frontend, engine.clone(), listener.tcp_config())
                    .await
                {
                    Ok(tcp) => tcp,
                    Err(e) => {
                        error!(addr = %listener.address, error = %e, "TCP bind failed");
                        return ExitCode::FAILURE;
                    }
                };
                tokio::spawn(async move { tcp.run().await });
            }
        }
    }

    tokio::spawn(run_health_checks(Arc::clone(&runtime), Arc::clone(&stats)));
    tokio::spawn(run_maintenance(
        Arc::clone(&runtime),
        Duration::from_secs(config.maintenance_interval_secs.max(1)),
    ));

    info!(
        version = dnslb::VERSION,
        listeners = config.listeners.len(),
        backends = backends.len(),
        "dnslb running"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal wait failed");
    }
    info!("shutting down");
    for backend in &backends {
        backend.stop();
    }
    info!(queries = stats.snapshot().queries, "bye");
    ExitCode::SUCCESS
}
