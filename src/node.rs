//! Node bootstrap and the public handle
//!
//! Wires the transport event loop to the exchange coordinator and hands the
//! running node back as an explicit handle, so several nodes can live in one
//! process (tests do exactly that).

use std::time::Duration;

use anyhow::{Context, Result};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::counter::coordinator::{ExchangeCommand, ExchangeCoordinator};
use crate::counter::session::{SessionId, SessionOrigin};
use crate::counter::{ExchangeError, PeerContact};
use crate::p2p::transport::{self, build_swarm};

/// Public events emitted by a running node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A peer announced itself on the local network.
    PeerDiscovered { peer_id: PeerId },
    /// A counter session started; either side may have opened the stream.
    SessionOpened {
        id: SessionId,
        peer_id: PeerId,
        origin: SessionOrigin,
    },
    /// A counter value arrived from a peer.
    CounterReceived {
        id: SessionId,
        peer_id: PeerId,
        value: u64,
    },
    /// A session ended after its write side failed.
    SessionClosed { id: SessionId, peer_id: PeerId },
    /// The one reconnect attempt after a session failure did not produce a
    /// new session. A successful attempt shows up as `SessionOpened` instead.
    ReconnectFailed { peer_id: PeerId },
}

/// Handle to a running node.
pub struct NodeHandle {
    local_peer_id: PeerId,
    listen_addrs: Vec<Multiaddr>,
    commands: mpsc::Sender<ExchangeCommand>,
    tasks: Vec<JoinHandle<()>>,
}

/// Start a node: identity, transport, listeners, and the exchange loops.
///
/// Fails only on bootstrap errors (unreadable identity key, unusable listen
/// address). Once started, steady-state failures stay local to their
/// sessions and are reported as events.
pub async fn start(config: Config) -> Result<(NodeHandle, mpsc::Receiver<NodeEvent>)> {
    let keypair = transport::load_or_generate_keypair(config.node.data_dir.as_deref())?;
    let local_peer_id = PeerId::from(keypair.public());
    info!(%local_peer_id, "Node identity");

    let mut swarm = build_swarm(&config.p2p, &keypair)?;

    let mut listen_addrs = Vec::new();
    for addr_str in &config.p2p.listen_addrs {
        let addr: Multiaddr = addr_str
            .parse()
            .with_context(|| format!("invalid listen address: {}", addr_str))?;
        listen_addrs.push(addr);
    }
    let bound = swarm.listen(&listen_addrs).await?;
    let control = swarm.control();

    // Channels between swarm event loop, coordinator, and consumers
    let (swarm_event_tx, swarm_event_rx) = mpsc::channel(256);
    let (swarm_cmd_tx, swarm_cmd_rx) = mpsc::channel(256);
    let (exchange_cmd_tx, exchange_cmd_rx) = mpsc::channel(16);
    let (node_event_tx, node_event_rx) = mpsc::channel(256);

    let (coordinator, session_rx) = ExchangeCoordinator::new(
        local_peer_id,
        Duration::from_millis(config.counter.tick_interval_ms),
        control,
        swarm_cmd_tx,
        node_event_tx,
    );

    let tasks = vec![
        tokio::spawn(swarm.run(swarm_event_tx, swarm_cmd_rx)),
        tokio::spawn(coordinator.run(swarm_event_rx, session_rx, exchange_cmd_rx)),
    ];

    let listen_addrs = bound
        .into_iter()
        .map(|addr| addr.with(Protocol::P2p(local_peer_id)))
        .collect();

    Ok((
        NodeHandle {
            local_peer_id,
            listen_addrs,
            commands: exchange_cmd_tx,
            tasks,
        },
        node_event_rx,
    ))
}

impl NodeHandle {
    /// Our peer id.
    pub fn peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// The bound listen addresses in full dialable form (`.../p2p/<peer-id>`).
    pub fn listen_addrs(&self) -> &[Multiaddr] {
        &self.listen_addrs
    }

    /// Connect to a peer multiaddr and start a counter exchange with it.
    ///
    /// The address must carry a `/p2p/` component naming the peer. One
    /// attempt is made; what to do about a failure is the caller's call.
    pub async fn connect(&self, addr: Multiaddr) -> Result<(), ExchangeError> {
        let Some((peer_id, transport_addr)) = transport::parse_peer_addr(&addr) else {
            return Err(ExchangeError::InvalidAddress(format!(
                "no /p2p/ peer id in {}",
                addr
            )));
        };
        let contact = PeerContact {
            peer_id,
            addrs: vec![transport_addr],
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ExchangeCommand::Connect {
                contact,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ExchangeError::NodeStopped)?;
        reply_rx.await.map_err(|_| ExchangeError::NodeStopped)?
    }

    /// Stop the node's tasks. Connections drop with the swarm and session
    /// loops wind down as their streams fail; nothing is drained.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
