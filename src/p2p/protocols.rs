//! Protocol identifiers

use libp2p::StreamProtocol;

/// Stream protocol carrying the counter exchange.
pub const COUNTER_PROTOCOL: StreamProtocol = StreamProtocol::new("/pulse/counter/1.0.0");

/// Identify protocol version announced to peers.
pub const IDENTIFY_PROTOCOL: &str = "/pulse/id/1.0.0";
