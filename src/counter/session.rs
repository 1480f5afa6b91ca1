//! Per-stream counter sessions
//!
//! Each stream gets an outbound loop (tick, increment, write) and an inbound
//! loop (read, report). The loops share nothing and never talk to each
//! other; they report to the coordinator over a channel and each ends on its
//! own first error.

use std::time::Duration;

use futures::{AsyncRead, AsyncReadExt, AsyncWrite};
use libp2p::{PeerId, Stream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::codec::{read_counter, write_counter};
use super::PeerContact;

/// Monotonic identifier for one counter session.
pub type SessionId = u64;

/// Which side opened the stream carrying a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// We dialed the peer and opened the stream.
    Dialed,
    /// The peer opened the stream to us.
    Accepted,
}

/// Events reported by session loops to the coordinator.
#[derive(Debug)]
pub enum SessionEvent {
    /// A counter value arrived on the inbound side.
    Received {
        id: SessionId,
        peer_id: PeerId,
        value: u64,
    },
    /// The outbound loop hit a write error and stopped. The contact is how
    /// the peer was reachable when the session started.
    WriteFailed { id: SessionId, contact: PeerContact },
    /// The inbound side ended (EOF or read error).
    ReadClosed { id: SessionId, peer_id: PeerId },
}

/// Handle on one session's pair of loops.
pub struct SessionHandle {
    pub id: SessionId,
    pub peer_id: PeerId,
    pub origin: SessionOrigin,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl SessionHandle {
    /// Stop both loops.
    pub fn abort(&self) {
        self.writer.abort();
        self.reader.abort();
    }
}

/// Split a stream and spawn the outbound and inbound loops for it.
pub fn spawn(
    id: SessionId,
    contact: PeerContact,
    origin: SessionOrigin,
    stream: Stream,
    tick: Duration,
    events: mpsc::Sender<SessionEvent>,
) -> SessionHandle {
    let peer_id = contact.peer_id;
    let (read_half, write_half) = stream.split();
    let writer = tokio::spawn(run_outbound(id, contact, write_half, tick, events.clone()));
    let reader = tokio::spawn(run_inbound(id, peer_id, read_half, events));
    SessionHandle {
        id,
        peer_id,
        origin,
        writer,
        reader,
    }
}

/// Outbound loop: sleep one tick, increment, write the frame.
///
/// The counter starts at zero, so the first value on the wire is 1. On a
/// write error the loop reports once and returns; the reconnect decision
/// belongs to the coordinator.
async fn run_outbound<W>(
    id: SessionId,
    contact: PeerContact,
    mut writer: W,
    tick: Duration,
    events: mpsc::Sender<SessionEvent>,
) where
    W: AsyncWrite + Unpin,
{
    let mut counter: u64 = 0;
    loop {
        tokio::time::sleep(tick).await;
        counter += 1;
        if let Err(e) = write_counter(&mut writer, counter).await {
            warn!(peer_id = %contact.peer_id, error = %e, "Error writing counter");
            let _ = events.send(SessionEvent::WriteFailed { id, contact }).await;
            return;
        }
    }
}

/// Inbound loop: read one frame at a time and report each value.
///
/// Ends on the first read error or EOF. A dead inbound side never triggers
/// a reconnect; only the write side does.
async fn run_inbound<R>(
    id: SessionId,
    peer_id: PeerId,
    mut reader: R,
    events: mpsc::Sender<SessionEvent>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match read_counter(&mut reader).await {
            Ok(value) => {
                let _ = events
                    .send(SessionEvent::Received { id, peer_id, value })
                    .await;
            }
            Err(e) => {
                debug!(%peer_id, error = %e, "Error reading counter");
                let _ = events.send(SessionEvent::ReadClosed { id, peer_id }).await;
                return;
            }
        }
    }
}
