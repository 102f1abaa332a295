//! Connection-oriented transport over UDP: stable peer identities, a
//! cursor-based packet codec, and polled authority/peer hosts.

pub mod authority;
pub mod error;
pub mod event;
pub mod packet;
pub mod peer;
pub mod registry;
pub mod runtime;
mod transport;

pub use authority::AuthorityHost;
pub use error::NetError;
pub use event::{NetEvent, Reliability};
pub use packet::{Fixed, Packet, PacketError};
pub use peer::PeerHost;
pub use registry::{PeerId, PeerRegistry, UNKNOWN_PEER};
pub use runtime::Runtime;
pub use transport::{CHANNEL_COUNT, LinkId, MAX_PAYLOAD_SIZE};
