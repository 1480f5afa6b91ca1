//! pulse-node daemon: run one node until interrupted
//!
//! Starts a node from config, optionally dials one peer given on the command
//! line, and prints the exchange as it happens.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use libp2p::Multiaddr;
use tracing::{info, warn};

use pulse_node::config::Config;
use pulse_node::node::NodeEvent;
use pulse_node::ExchangeError;

#[derive(Parser)]
#[command(name = "pulse-node")]
#[command(about = "Minimal local-network peer-to-peer counter exchange")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pulse-node.toml")]
    config: String,

    /// Data directory for the persistent node identity
    #[arg(short, long, env = "PULSE_DATA_DIR")]
    data_dir: Option<String>,

    /// Peer multiaddr to connect to after startup
    #[arg(long, env = "PULSE_PEER_ADDRESS")]
    peer_address: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pulse_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting pulse-node");
    info!("Config file: {}", cli.config);

    // Load or create default config
    let mut config = if std::path::Path::new(&cli.config).exists() {
        let content = std::fs::read_to_string(&cli.config)?;
        toml::from_str(&content)?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = Some(PathBuf::from(data_dir));
    }

    let (handle, mut events) = pulse_node::start(config).await?;

    info!("ID: {}", handle.peer_id());
    for addr in handle.listen_addrs() {
        info!("Full multiaddr: {}", addr);
    }

    // Optional manual connect; a failed dial is not fatal, the node keeps
    // listening and discovering.
    if let Some(peer_address) = cli.peer_address {
        let addr: Multiaddr = peer_address.parse().context("invalid peer address")?;
        info!(%addr, "Connecting to peer");
        match handle.connect(addr).await {
            Ok(()) => {}
            Err(e @ ExchangeError::InvalidAddress(_)) => return Err(e.into()),
            Err(e) => warn!(error = %e, "Failed to connect to peer"),
        }
    }

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                NodeEvent::PeerDiscovered { peer_id } => {
                    info!("Found peer: {}", peer_id);
                }
                NodeEvent::SessionOpened { peer_id, origin, .. } => {
                    info!("Counter exchange started with {} ({:?})", peer_id, origin);
                }
                NodeEvent::CounterReceived { peer_id, value, .. } => {
                    info!("Received {} from {}", value, peer_id);
                }
                NodeEvent::SessionClosed { peer_id, .. } => {
                    info!("Counter session with {} closed", peer_id);
                }
                NodeEvent::ReconnectFailed { peer_id } => {
                    warn!("Reconnect to {} failed, giving up", peer_id);
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down");
    handle.shutdown();
    Ok(())
}
