use std::io;

use crate::registry::PeerId;

/// Errors returned by host construction, connection and send operations.
///
/// Failures encountered while draining events are absorbed inside `service`
/// and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("failed to bind listening endpoint: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to acquire a local socket: {0}")]
    Exhausted(#[source] io::Error),

    #[error("connection refused: {reason}")]
    ConnectFailure { reason: String },

    #[error("connection attempt timed out")]
    ConnectTimeout,

    #[error("no connected peer with identity {peer}")]
    UnknownPeer { peer: PeerId },

    #[error("channel {channel} out of range")]
    InvalidChannel { channel: u8 },

    #[error("payload of {size} bytes exceeds the single-datagram limit")]
    PayloadTooLarge { size: usize },

    #[error("transport runtime is not initialized")]
    NotInitialized,
}
