//! pulse-node: minimal local-network peer-to-peer counter exchange
//!
//! A pulse node discovers peers on the local network via mDNS, connects over
//! an encrypted libp2p transport, and exchanges an incrementing u64 counter
//! with each peer: one 8-byte big-endian frame per second in each direction.
//!
//! - Discovery-driven connects, plus an optional manual dial at startup
//! - One session per stream: an outbound loop and an inbound loop
//! - A write failure triggers exactly one reconnect attempt; a read failure
//!   just ends the inbound side
//!
//! Transport security, multiplexing, and discovery internals are delegated
//! to libp2p.

pub mod config;
pub mod counter;
pub mod node;
pub mod p2p;

pub use config::Config;
pub use counter::{ExchangeError, PeerContact};
pub use node::{start, NodeEvent, NodeHandle};
