use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use kinectron::config::BridgeConfig;
use kinectron::server::ManagerEvent;
use kinectron::{LocalUi, PeerGateway, PeerServerManager, WsRelayTransport, logging};

/// Run the peer relay server on its own
#[derive(Parser, Debug)]
#[command(name = "kinectron-relay")]
#[command(version, about = "Relay server for kinectron peers", long_about = None)]
struct CliArgs {
    /// YAML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen port (overrides the configuration file)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Default log filter when RUST_LOG is unset
    #[arg(short = 'l', long, value_name = "FILTER", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    logging::init(&args.log);

    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    if let Some(port) = args.port {
        config.peer_server.port = port;
    }
    config.validate().context("invalid configuration")?;

    info!("Starting kinectron relay v{}", env!("CARGO_PKG_VERSION"));

    let gateway = Arc::new(PeerGateway::new(LocalUi::new()));
    let manager = PeerServerManager::new(WsRelayTransport::new(), config.peer_server, gateway);

    let mut events = manager.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ManagerEvent::Ready { host, port, path, .. }) => {
                    info!("Relay listening on ws://{}:{}{}", host, port, path)
                }
                Ok(ManagerEvent::Connection { client_id }) => info!("Peer connected: {}", client_id),
                Ok(ManagerEvent::Disconnect { client_id }) => info!("Peer disconnected: {}", client_id),
                Ok(ManagerEvent::Error { message, connections, .. }) => {
                    warn!(connections, "Relay error: {}", message)
                }
                Ok(ManagerEvent::Fatal { message }) => error!("Relay failed: {}", message),
                Ok(ManagerEvent::Closed { .. }) => break,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    manager.initialize().await.context("relay server failed to start")?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    info!("Shutting down");
    manager.close().await;
    let _ = logger.await;

    Ok(())
}
