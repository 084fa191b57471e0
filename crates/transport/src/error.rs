use thiserror::Error;

use crate::link::PeerId;

/// Errors that can occur in the fanout transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("peer {0} is not connected")]
    PeerUnavailable(PeerId),

    #[error("link closed")]
    Closed,

    #[error("endpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
}
