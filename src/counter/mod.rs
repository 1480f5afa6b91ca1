//! Counter exchange - the application protocol
//!
//! Handles:
//! - 8-byte big-endian counter wire format
//! - Per-stream sessions (one outbound loop, one inbound loop)
//! - Discovery-driven connects and the single reconnect after a write failure

pub mod codec;
pub mod coordinator;
pub mod session;

use libp2p::{Multiaddr, PeerId};

// Re-exports
pub use coordinator::{ExchangeCommand, ExchangeCoordinator};
pub use session::{SessionEvent, SessionHandle, SessionId, SessionOrigin};

/// How to reach a peer: its identity plus the addresses we know for it.
#[derive(Debug, Clone)]
pub struct PeerContact {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// Errors from connecting to a peer and starting an exchange.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("failed to open counter stream: {0}")]
    OpenStream(String),

    #[error("node is not running")]
    NodeStopped,
}
