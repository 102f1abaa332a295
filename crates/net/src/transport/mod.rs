//! Reliable-delivery layer over UDP: framing, handshake state, duplicate
//! detection and retransmission. Hosts sit on top of this; applications
//! never touch it directly.

pub(crate) mod endpoint;
pub(crate) mod link;
pub(crate) mod tracking;
pub(crate) mod wire;

pub use link::LinkId;
pub use wire::{CHANNEL_COUNT, MAX_PAYLOAD_SIZE};
