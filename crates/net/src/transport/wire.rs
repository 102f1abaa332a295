use rkyv::{Archive, Deserialize, Serialize, rancor};

/// Largest datagram the transport will emit. Oversized sends fail rather
/// than fragment.
pub const MAX_DATAGRAM_SIZE: usize = 1200;
/// Largest application payload, leaving framing headroom under the datagram
/// limit.
pub const MAX_PAYLOAD_SIZE: usize = 1024;
/// Independently ordered reliable sub-streams per connection.
pub const CHANNEL_COUNT: u8 = 2;
pub const PROTOCOL_MAGIC: u32 = 0x54455448;
pub const PROTOCOL_VERSION: u32 = 1;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bits: u32,
}

impl FrameHeader {
    pub fn new(sequence: u32, ack: u32, ack_bits: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bits,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

/// Wrapping comparison: true when `s1` is newer than `s2`.
#[inline]
pub fn sequence_newer(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum FrameBody {
    ConnectRequest {
        client_salt: u64,
    },
    ConnectChallenge {
        server_salt: u64,
        challenge: u64,
    },
    ChallengeResponse {
        combined_salt: u64,
    },
    ConnectAccepted,
    ConnectDenied {
        reason: String,
    },
    Payload {
        channel: u8,
        reliable: bool,
        message_seq: u32,
        data: Vec<u8>,
    },
    Disconnect,
    KeepAlive,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Frame {
    pub header: FrameHeader,
    pub body: FrameBody,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("frame deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

impl Frame {
    pub fn new(header: FrameHeader, body: FrameBody) -> Self {
        Self { header, body }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(WireError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, WireError> {
        rkyv::from_bytes::<Self, rancor::Error>(data).map_err(WireError::Deserialize)
    }
}
