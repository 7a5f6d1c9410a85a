//! STRATUM - Tiered Payload Manager
//!
//! Server entry point: load configuration, install telemetry, assemble
//! the node, and serve the HTTP frontend until SIGINT/SIGTERM. Shutdown
//! drains background machinery before telemetry is torn down.

use stratum::api;
use stratum::config::RuntimeConfig;
use stratum::observability::Telemetry;
use stratum::runtime::Node;

fn usage() {
    eprintln!("Usage: stratum [config.toml]");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(flag) if flag == "-h" || flag == "--help" => {
            usage();
            return Ok(());
        }
        Some(path) => RuntimeConfig::load(&path)?,
        None => RuntimeConfig::default(),
    };

    let telemetry = Telemetry::init(&config.observability, &config.node_id)?;

    tracing::info!("═══════════════════════════════════════════════");
    tracing::info!("  STRATUM - Tiered Payload Manager");
    tracing::info!("  Version: {}", stratum::VERSION);
    tracing::info!("  Node: {}", config.node_id);
    tracing::info!("═══════════════════════════════════════════════");

    let node = Node::build(&config).await?;
    let state = api::app_state(node.context());

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("signal handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
    };

    let result = api::serve(&config.server.bind_address, state, shutdown).await;

    node.shutdown().await;
    telemetry.shutdown();

    match result {
        Ok(()) => {
            tracing::info!("stratum shutdown complete");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!(e)),
    }
}
