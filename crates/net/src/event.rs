use crate::packet::Packet;
use crate::registry::PeerId;

/// Delivery guarantee for an outgoing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// Guaranteed, per-channel ordered, retransmitted until acknowledged.
    Reliable,
    /// Best effort: unordered, never retransmitted, duplicates dropped.
    Unreliable,
}

/// A transport notification surfaced by a `service` call.
///
/// Events are only produced while draining a host; the peer identity they
/// carry is already resolvable (Connect) or already retired (Disconnect) by
/// the time the caller sees them.
#[derive(Debug, Clone)]
pub enum NetEvent {
    Connect { peer: PeerId },
    Disconnect { peer: PeerId },
    Receive { peer: PeerId, packet: Packet },
}

impl NetEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            NetEvent::Connect { peer }
            | NetEvent::Disconnect { peer }
            | NetEvent::Receive { peer, .. } => *peer,
        }
    }
}
