use serde::{Deserialize, Serialize};

/// Identifies which registered handler an inbound message is routed to.
pub type ProtocolId = u8;

/// Wire-format envelope carried by every [`Link`](crate::Link).
///
/// Envelopes are serialized with MessagePack. The `protocol` byte selects the
/// handler registered on the receiving [`ProtocolMux`](crate::ProtocolMux);
/// the payload is opaque to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol id used for handler routing.
    pub protocol: ProtocolId,

    /// MessagePack-encoded payload bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    /// Schema version for forward-compatible evolution.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    1
}

impl Message {
    /// Create a new message, serializing the payload with MessagePack.
    pub fn new<T: Serialize>(
        protocol: ProtocolId,
        payload: &T,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            protocol,
            payload: rmp_serde::to_vec(payload)?,
            version: 1,
        })
    }

    /// Wrap already-encoded bytes without re-serializing them.
    pub fn from_raw(protocol: ProtocolId, payload: Vec<u8>) -> Self {
        Self {
            protocol,
            payload,
            version: 1,
        }
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.payload)
    }

    /// Serialize this entire message envelope to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize a message envelope from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    /// Payload size in bytes, used for transfer accounting.
    ///
    /// Only the payload is counted. The envelope header and any link
    /// framing (ZeroMQ frames, peer identities) are not included.
    pub fn wire_len(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Helper module for serde to handle `Vec<u8>` as raw bytes in MessagePack.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}
