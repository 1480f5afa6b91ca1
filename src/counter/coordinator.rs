//! Exchange coordinator
//!
//! Owns the session registry and drives connects: discovery notifications
//! (skipping ourselves and peers we already dialed), incoming counter
//! streams, manual connects from the node handle, and the single reconnect
//! attempt after a session's write side fails.

use std::collections::HashMap;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId, Stream};
use libp2p_stream::Control;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::node::NodeEvent;
use crate::p2p::protocols::COUNTER_PROTOCOL;
use crate::p2p::transport::{SwarmCommand, SwarmEvent};
use super::session::{self, SessionEvent, SessionHandle, SessionId, SessionOrigin};
use super::{ExchangeError, PeerContact};

/// Commands sent from the node handle to the coordinator.
pub enum ExchangeCommand {
    /// Connect to a peer and start a counter session with it.
    Connect {
        contact: PeerContact,
        reply: oneshot::Sender<Result<(), ExchangeError>>,
    },
}

/// Orchestrates counter sessions across peers.
pub struct ExchangeCoordinator {
    local_peer_id: PeerId,
    tick_interval: Duration,
    control: Control,
    commands: mpsc::Sender<SwarmCommand>,
    node_events: mpsc::Sender<NodeEvent>,
    session_events: mpsc::Sender<SessionEvent>,
    sessions: HashMap<SessionId, SessionHandle>,
    dialed_peers: HashMap<PeerId, SessionId>,
    last_seen_addr: HashMap<PeerId, Multiaddr>,
    next_session_id: SessionId,
}

impl ExchangeCoordinator {
    /// Create a coordinator plus the receiver its session loops report into.
    pub fn new(
        local_peer_id: PeerId,
        tick_interval: Duration,
        control: Control,
        commands: mpsc::Sender<SwarmCommand>,
        node_events: mpsc::Sender<NodeEvent>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (session_tx, session_rx) = mpsc::channel(256);
        (
            Self {
                local_peer_id,
                tick_interval,
                control,
                commands,
                node_events,
                session_events: session_tx,
                sessions: HashMap::new(),
                dialed_peers: HashMap::new(),
                last_seen_addr: HashMap::new(),
                next_session_id: 0,
            },
            session_rx,
        )
    }

    /// Run the coordinator event loop.
    pub async fn run(
        mut self,
        mut swarm_events: mpsc::Receiver<SwarmEvent>,
        mut session_events: mpsc::Receiver<SessionEvent>,
        mut commands: mpsc::Receiver<ExchangeCommand>,
    ) {
        loop {
            tokio::select! {
                Some(event) = swarm_events.recv() => {
                    self.handle_swarm_event(event).await;
                }
                Some(event) = session_events.recv() => {
                    self.handle_session_event(event).await;
                }
                Some(command) = commands.recv() => {
                    self.handle_command(command).await;
                }
                else => break,
            }
        }
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent) {
        match event {
            SwarmEvent::PeerDiscovered { peer_id, addrs } => {
                self.handle_peer_discovered(peer_id, addrs).await;
            }
            SwarmEvent::PeerExpired { peer_id } => {
                // Sessions outlive the mDNS record; only stream errors end
                // them. The cached dial address does not.
                debug!(%peer_id, "Peer expired");
                self.last_seen_addr.remove(&peer_id);
            }
            SwarmEvent::IncomingStream { peer_id, stream } => {
                let addrs = self
                    .last_seen_addr
                    .get(&peer_id)
                    .cloned()
                    .into_iter()
                    .collect();
                let contact = PeerContact { peer_id, addrs };
                self.spawn_session(contact, SessionOrigin::Accepted, stream)
                    .await;
            }
            SwarmEvent::ConnectionEstablished { peer_id, address } => {
                self.last_seen_addr.insert(peer_id, address);
            }
        }
    }

    /// Discovery notification: connect to every newly found peer except
    /// ourselves. Discovery keeps running whatever the outcome.
    async fn handle_peer_discovered(&mut self, peer_id: PeerId, addrs: Vec<Multiaddr>) {
        if peer_id == self.local_peer_id {
            debug!("Ignoring self-discovery");
            return;
        }
        debug!(%peer_id, "Found peer");
        let _ = self
            .node_events
            .send(NodeEvent::PeerDiscovered { peer_id })
            .await;

        if self.dialed_peers.contains_key(&peer_id) {
            debug!(%peer_id, "Counter session already running, not connecting again");
            return;
        }
        if let Err(e) = self.connect_to_peer(PeerContact { peer_id, addrs }).await {
            warn!(%peer_id, error = %e, "Failed to connect to discovered peer");
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Received { id, peer_id, value } => {
                debug!(%peer_id, value, "Received counter");
                let _ = self
                    .node_events
                    .send(NodeEvent::CounterReceived { id, peer_id, value })
                    .await;
            }
            SessionEvent::WriteFailed { id, contact } => {
                let peer_id = contact.peer_id;
                self.remove_session(id, peer_id).await;
                info!(%peer_id, "Trying to reconnect");
                match self.connect_to_peer(contact).await {
                    Ok(new_id) => debug!(session = new_id, "Reconnected"),
                    Err(e) => {
                        warn!(%peer_id, error = %e, "Reconnect failed");
                        let _ = self
                            .node_events
                            .send(NodeEvent::ReconnectFailed { peer_id })
                            .await;
                    }
                }
            }
            SessionEvent::ReadClosed { id, peer_id } => {
                // The write side owns reconnection; nothing to do here.
                debug!(session = id, %peer_id, "Counter stream read side closed");
            }
        }
    }

    async fn handle_command(&mut self, command: ExchangeCommand) {
        match command {
            ExchangeCommand::Connect { contact, reply } => {
                let result = self.connect_to_peer(contact).await.map(|_| ());
                let _ = reply.send(result);
            }
        }
    }

    /// Connect to a peer and start one counter session over a fresh stream.
    ///
    /// A single attempt; retrying is the caller's decision.
    async fn connect_to_peer(&mut self, contact: PeerContact) -> Result<SessionId, ExchangeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(SwarmCommand::Connect {
                peer_id: contact.peer_id,
                addrs: contact.addrs.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| ExchangeError::NodeStopped)?;
        reply_rx
            .await
            .map_err(|_| ExchangeError::NodeStopped)?
            .map_err(|e| ExchangeError::Dial(e.to_string()))?;
        debug!(peer_id = %contact.peer_id, "Connected");

        let stream = self
            .control
            .open_stream(contact.peer_id, COUNTER_PROTOCOL)
            .await
            .map_err(|e| ExchangeError::OpenStream(e.to_string()))?;

        Ok(self
            .spawn_session(contact, SessionOrigin::Dialed, stream)
            .await)
    }

    async fn spawn_session(
        &mut self,
        contact: PeerContact,
        origin: SessionOrigin,
        stream: Stream,
    ) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id += 1;
        let peer_id = contact.peer_id;
        let handle = session::spawn(
            id,
            contact,
            origin,
            stream,
            self.tick_interval,
            self.session_events.clone(),
        );
        if origin == SessionOrigin::Dialed {
            self.dialed_peers.insert(peer_id, id);
        }
        self.sessions.insert(id, handle);
        debug!(session = id, %peer_id, ?origin, "Counter session started");
        let _ = self
            .node_events
            .send(NodeEvent::SessionOpened {
                id,
                peer_id,
                origin,
            })
            .await;
        id
    }

    async fn remove_session(&mut self, id: SessionId, peer_id: PeerId) {
        if let Some(handle) = self.sessions.remove(&id) {
            handle.abort();
            if handle.origin == SessionOrigin::Dialed
                && self.dialed_peers.get(&peer_id) == Some(&id)
            {
                self.dialed_peers.remove(&peer_id);
            }
            let _ = self
                .node_events
                .send(NodeEvent::SessionClosed { id, peer_id })
                .await;
        }
    }
}
