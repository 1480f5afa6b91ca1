//! libp2p transport configuration
//!
//! Builds the PulseSwarm with multi-transport support (QUIC + TCP/Noise/Yamux),
//! mDNS discovery, identify, and raw streams for the counter protocol.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::{FutureExt, StreamExt};
use libp2p::core::transport::ListenerId;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{DialError, NetworkBehaviour, SwarmEvent as LibSwarmEvent};
use libp2p::{
    identity, mdns, noise, tcp, yamux,
    Multiaddr, PeerId, Stream, Swarm, SwarmBuilder,
};
use libp2p_stream::{Behaviour as StreamBehaviour, Control, IncomingStreams};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::P2PConfig;
use super::protocols::{COUNTER_PROTOCOL, IDENTIFY_PROTOCOL};

/// Combined libp2p behaviour for pulse nodes.
#[derive(NetworkBehaviour)]
pub struct PulseBehaviour {
    pub stream: StreamBehaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub identify: libp2p::identify::Behaviour,
}

/// Events emitted by the swarm for the coordinator to process.
#[derive(Debug)]
pub enum SwarmEvent {
    /// A new peer was discovered on the local network.
    PeerDiscovered { peer_id: PeerId, addrs: Vec<Multiaddr> },
    /// A discovered peer's mDNS record expired.
    PeerExpired { peer_id: PeerId },
    /// A remote peer opened a counter stream to us.
    IncomingStream { peer_id: PeerId, stream: Stream },
    /// A connection to a peer is up, with the remote's observed address.
    ConnectionEstablished { peer_id: PeerId, address: Multiaddr },
}

/// Commands sent from the coordinator to the swarm task.
pub enum SwarmCommand {
    /// Connect to a peer, replying once the connection is up or has failed.
    Connect {
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Wrapper around the libp2p Swarm with pulse-specific helpers.
pub struct PulseSwarm {
    swarm: Swarm<PulseBehaviour>,
    control: Control,
    incoming: IncomingStreams,
    local_peer_id: PeerId,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<()>>>>,
    early_events: Vec<LibSwarmEvent<PulseBehaviourEvent>>,
}

impl PulseSwarm {
    /// Get our local peer ID.
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// A handle for opening outbound counter streams.
    pub fn control(&self) -> Control {
        self.control.clone()
    }

    /// Start the configured listeners and wait until every one has bound.
    ///
    /// Returns the bound addresses with OS-assigned ports resolved. A
    /// wildcard address contributes one entry per interface. Swarm events
    /// arriving while we wait are buffered and replayed by `run`.
    pub async fn listen(&mut self, addrs: &[Multiaddr]) -> Result<Vec<Multiaddr>> {
        let mut pending: HashSet<ListenerId> = HashSet::new();
        for addr in addrs {
            let id = self
                .swarm
                .listen_on(addr.clone())
                .with_context(|| format!("failed to listen on {}", addr))?;
            pending.insert(id);
        }

        let mut bound = Vec::new();
        while !pending.is_empty() {
            match self.swarm.select_next_some().await {
                LibSwarmEvent::NewListenAddr {
                    listener_id,
                    address,
                } => {
                    info!(%address, "Listening on");
                    pending.remove(&listener_id);
                    bound.push(address);
                }
                LibSwarmEvent::ListenerClosed {
                    listener_id,
                    reason,
                    ..
                } if pending.contains(&listener_id) => {
                    bail!("listener closed before binding: {:?}", reason);
                }
                other => self.early_events.push(other),
            }
        }

        // A wildcard listener reports one address per interface and the wait
        // above returns on the first per listener. Drain the rest while they
        // are already queued.
        while let Some(Some(event)) = self.swarm.next().now_or_never() {
            match event {
                LibSwarmEvent::NewListenAddr { address, .. } => {
                    info!(%address, "Listening on");
                    bound.push(address);
                }
                other => self.early_events.push(other),
            }
        }
        Ok(bound)
    }

    /// Run the swarm event loop, forwarding events to the coordinator and
    /// serving its connect commands.
    pub async fn run(
        mut self,
        event_tx: mpsc::Sender<SwarmEvent>,
        mut commands: mpsc::Receiver<SwarmCommand>,
    ) {
        for event in std::mem::take(&mut self.early_events) {
            self.handle_swarm_event(event, &event_tx).await;
        }

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event, &event_tx).await;
                }
                Some((peer_id, stream)) = self.incoming.next() => {
                    debug!(%peer_id, "Incoming counter stream");
                    let _ = event_tx
                        .send(SwarmEvent::IncomingStream { peer_id, stream })
                        .await;
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command);
                }
            }
        }
    }

    async fn handle_swarm_event(
        &mut self,
        event: LibSwarmEvent<PulseBehaviourEvent>,
        event_tx: &mpsc::Sender<SwarmEvent>,
    ) {
        match event {
            // mDNS discovery
            LibSwarmEvent::Behaviour(PulseBehaviourEvent::Mdns(mdns::Event::Discovered(
                peers,
            ))) => {
                // One notification can carry several addresses per peer.
                let mut found: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer_id, addr) in peers {
                    debug!(%peer_id, %addr, "mDNS: peer discovered");
                    found.entry(peer_id).or_default().push(addr);
                }
                for (peer_id, addrs) in found {
                    let _ = event_tx
                        .send(SwarmEvent::PeerDiscovered { peer_id, addrs })
                        .await;
                }
            }
            LibSwarmEvent::Behaviour(PulseBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _addr) in peers {
                    debug!(%peer_id, "mDNS: peer expired");
                    let _ = event_tx.send(SwarmEvent::PeerExpired { peer_id }).await;
                }
            }

            // Identify events (log only)
            LibSwarmEvent::Behaviour(PulseBehaviourEvent::Identify(
                libp2p::identify::Event::Received { peer_id, info },
            )) => {
                debug!(
                    %peer_id,
                    agent = %info.agent_version,
                    "Identified peer"
                );
            }
            LibSwarmEvent::Behaviour(_) => {}

            // Connection events
            LibSwarmEvent::NewListenAddr { address, .. } => {
                // Interfaces that come up after startup land here; print the
                // dialable form since `listen` no longer sees them.
                let address = address.with(Protocol::P2p(self.local_peer_id));
                info!(%address, "Listening on");
            }
            LibSwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                debug!(%peer_id, "Connection established");
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for reply in waiters {
                        let _ = reply.send(Ok(()));
                    }
                }
                let _ = event_tx
                    .send(SwarmEvent::ConnectionEstablished {
                        peer_id,
                        address: endpoint.get_remote_address().clone(),
                    })
                    .await;
            }
            LibSwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!(%peer_id, "Connection closed");
            }
            LibSwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                warn!(%peer_id, %error, "Outgoing connection failed");
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    let reason = error.to_string();
                    for reply in waiters {
                        let _ = reply.send(Err(anyhow!("{}", reason)));
                    }
                }
            }

            _ => {}
        }
    }

    fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Connect {
                peer_id,
                addrs,
                reply,
            } => {
                if self.swarm.is_connected(&peer_id) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let opts = DialOpts::peer_id(peer_id)
                    .addresses(addrs)
                    .extend_addresses_through_behaviour()
                    .condition(PeerCondition::DisconnectedAndNotDialing)
                    .build();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        debug!(%peer_id, "Dialing peer");
                        self.pending_dials.entry(peer_id).or_default().push(reply);
                    }
                    // A dial to this peer is already in flight; its outcome
                    // resolves this request too.
                    Err(DialError::DialPeerConditionFalse(_)) => {
                        self.pending_dials.entry(peer_id).or_default().push(reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(anyhow!(e)));
                    }
                }
            }
        }
    }
}

/// Build the libp2p swarm from config.
///
/// Configures transports, constructs the composite behaviour, and registers
/// the counter protocol for incoming streams. Listeners are started
/// separately via [`PulseSwarm::listen`].
pub fn build_swarm(config: &P2PConfig, keypair: &identity::Keypair) -> Result<PulseSwarm> {
    let local_peer_id = PeerId::from(keypair.public());

    // mDNS for local peer discovery, unless disabled
    let mdns = if config.mdns_enabled {
        let behaviour = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
            .context("mDNS behaviour")?;
        Some(behaviour)
    } else {
        None
    };

    let swarm = SwarmBuilder::with_existing_identity(keypair.clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .context("TCP transport")?
        .with_quic()
        .with_behaviour(|key| {
            // Identify protocol
            let identify = libp2p::identify::Behaviour::new(
                libp2p::identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                    .with_agent_version(format!("pulse-node/{}", env!("CARGO_PKG_VERSION"))),
            );

            PulseBehaviour {
                stream: StreamBehaviour::new(),
                mdns: mdns.into(),
                identify,
            }
        })
        .context("swarm behaviour")?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    let mut control = swarm.behaviour().stream.new_control();
    let incoming = match control.accept(COUNTER_PROTOCOL) {
        Ok(incoming) => incoming,
        Err(err) => bail!("failed to register counter stream handler: {:?}", err),
    };

    Ok(PulseSwarm {
        swarm,
        control,
        incoming,
        local_peer_id,
        pending_dials: HashMap::new(),
        early_events: Vec::new(),
    })
}

/// Load an Ed25519 keypair from disk, or generate one.
///
/// With a data directory the keypair is stored as protobuf-encoded bytes at
/// `{data_dir}/node_key` and reloaded on later starts. Without one the
/// identity is ephemeral.
pub fn load_or_generate_keypair(data_dir: Option<&Path>) -> Result<identity::Keypair> {
    let Some(data_dir) = data_dir else {
        debug!("No data directory configured, using ephemeral identity");
        return Ok(identity::Keypair::generate_ed25519());
    };

    let key_path = data_dir.join("node_key");

    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("reading node key")?;
        let keypair =
            identity::Keypair::from_protobuf_encoding(&bytes).context("decoding node key")?;
        info!("Loaded existing node identity");
        Ok(keypair)
    } else {
        let keypair = identity::Keypair::generate_ed25519();
        // Ensure data dir exists
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let bytes = keypair
            .to_protobuf_encoding()
            .context("encoding node key")?;
        std::fs::write(&key_path, &bytes).context("writing node key")?;
        info!("Generated new node identity");
        Ok(keypair)
    }
}

/// Split a full peer multiaddr like `/ip4/1.2.3.4/tcp/4001/p2p/12D3Koo...`
/// into a (PeerId, Multiaddr) pair, with the `/p2p/` suffix stripped from
/// the address.
pub fn parse_peer_addr(addr: &Multiaddr) -> Option<(PeerId, Multiaddr)> {
    let peer_id = addr.iter().find_map(|p| {
        if let Protocol::P2p(peer_id) = p {
            Some(peer_id)
        } else {
            None
        }
    })?;
    let addr_without_p2p: Multiaddr = addr
        .iter()
        .filter(|p| !matches!(p, Protocol::P2p(_)))
        .collect();
    Some((peer_id, addr_without_p2p))
}
