//! P2P networking layer - libp2p transport
//!
//! Handles:
//! - Multi-transport (QUIC + TCP with Noise/Yamux)
//! - Raw counter streams keyed by protocol id
//! - Peer discovery (mDNS)

pub mod protocols;
pub mod transport;

pub use transport::build_swarm;
