use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::message::Message;

/// Identity of one process on a link.
///
/// The coordinator is always [`PeerId::COORDINATOR`]; executors get ids
/// assigned by the link when they join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl PeerId {
    pub const COORDINATOR: PeerId = PeerId(0);

    pub fn is_coordinator(self) -> bool {
        self == Self::COORDINATOR
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Something that happened on a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A peer joined the link.
    Connected(PeerId),
    /// A peer sent us a message.
    Message { from: PeerId, message: Message },
    /// A peer left the link, either cleanly or by timing out.
    Disconnected(PeerId),
}

/// A long-lived connection set between one coordinator and its executors.
///
/// Implementations deliver byte envelopes to named peers, broadcast to every
/// connected peer, and surface membership changes as [`LinkEvent`]s.
#[async_trait]
pub trait Link: Send + Sync {
    /// The id this process is known by on the link.
    fn local_id(&self) -> PeerId;

    /// Deliver a message to a single peer.
    async fn send_to(&self, peer: PeerId, message: Message) -> Result<(), TransportError>;

    /// Deliver a message to every connected peer except ourselves.
    async fn broadcast(&self, message: Message) -> Result<(), TransportError>;

    /// Receive the next event. Blocks until one is available.
    ///
    /// Returns [`TransportError::Closed`] once the link is gone for good.
    async fn recv(&self) -> Result<LinkEvent, TransportError>;
}

/// Blanket implementation so `Arc<dyn Link>` can be used directly.
#[async_trait]
impl<T: Link + ?Sized> Link for Arc<T> {
    fn local_id(&self) -> PeerId {
        (**self).local_id()
    }

    async fn send_to(&self, peer: PeerId, message: Message) -> Result<(), TransportError> {
        (**self).send_to(peer, message).await
    }

    async fn broadcast(&self, message: Message) -> Result<(), TransportError> {
        (**self).broadcast(message).await
    }

    async fn recv(&self) -> Result<LinkEvent, TransportError> {
        (**self).recv().await
    }
}
