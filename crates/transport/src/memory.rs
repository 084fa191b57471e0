//! In-process link used by tests and single-host runs.
//!
//! A [`MemoryHub`] plays the role of the network: every [`MemoryLink`] joined
//! to it can address every other by [`PeerId`]. Peers can be dropped on
//! purpose with [`MemoryHub::disconnect`] to exercise failure handling.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;
use crate::link::{Link, LinkEvent, PeerId};
use crate::message::Message;

#[derive(Debug)]
struct HubInner {
    peers: BTreeMap<PeerId, mpsc::UnboundedSender<LinkEvent>>,
    next_id: u32,
}

/// Shared switchboard connecting [`MemoryLink`]s.
#[derive(Debug, Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                peers: BTreeMap::new(),
                next_id: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Join the hub as the coordinator.
    pub fn coordinator(&self) -> MemoryLink {
        self.join(PeerId::COORDINATOR)
    }

    /// Join the hub as a new executor with a fresh id.
    pub fn executor(&self) -> MemoryLink {
        let id = {
            let mut inner = self.lock();
            let id = PeerId(inner.next_id);
            inner.next_id += 1;
            id
        };
        self.join(id)
    }

    fn join(&self, id: PeerId) -> MemoryLink {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        for peer_tx in inner.peers.values() {
            let _ = peer_tx.send(LinkEvent::Connected(id));
        }
        inner.peers.insert(id, tx);
        debug!(peer = %id, "joined memory hub");
        MemoryLink {
            id,
            hub: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Remove `peer` from the hub and tell everyone else it is gone.
    ///
    /// The removed link sees [`TransportError::Closed`] once its queue drains.
    pub fn disconnect(&self, peer: PeerId) {
        let mut inner = self.lock();
        if inner.peers.remove(&peer).is_some() {
            debug!(peer = %peer, "left memory hub");
            for peer_tx in inner.peers.values() {
                let _ = peer_tx.send(LinkEvent::Disconnected(peer));
            }
        }
    }

    /// Currently connected peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.lock().peers.keys().copied().collect()
    }

    fn is_member(&self, peer: PeerId) -> bool {
        self.lock().peers.contains_key(&peer)
    }
}

/// One process's view of a [`MemoryHub`].
#[derive(Debug)]
pub struct MemoryLink {
    id: PeerId,
    hub: MemoryHub,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl MemoryLink {
    /// Leave the hub. Equivalent to dropping the link.
    pub fn close(&self) {
        self.hub.disconnect(self.id);
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn local_id(&self) -> PeerId {
        self.id
    }

    async fn send_to(&self, peer: PeerId, message: Message) -> Result<(), TransportError> {
        let inner = self.hub.lock();
        if !inner.peers.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        let tx = inner
            .peers
            .get(&peer)
            .ok_or(TransportError::PeerUnavailable(peer))?;
        tx.send(LinkEvent::Message {
            from: self.id,
            message,
        })
        .map_err(|_| TransportError::PeerUnavailable(peer))
    }

    async fn broadcast(&self, message: Message) -> Result<(), TransportError> {
        let inner = self.hub.lock();
        if !inner.peers.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        for (peer, tx) in inner.peers.iter().filter(|(peer, _)| **peer != self.id) {
            if tx
                .send(LinkEvent::Message {
                    from: self.id,
                    message: message.clone(),
                })
                .is_err()
            {
                debug!(peer = %peer, "broadcast target went away");
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<LinkEvent, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        if self.hub.is_member(self.id) {
            self.hub.disconnect(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unicast_and_broadcast() {
        let hub = MemoryHub::new();
        let coord = hub.coordinator();
        let a = hub.executor();
        let b = hub.executor();

        assert_eq!(coord.recv().await.unwrap(), LinkEvent::Connected(a.local_id()));
        assert_eq!(coord.recv().await.unwrap(), LinkEvent::Connected(b.local_id()));
        assert_eq!(a.recv().await.unwrap(), LinkEvent::Connected(b.local_id()));

        coord.broadcast(Message::from_raw(1, vec![1])).await.unwrap();
        for link in [&a, &b] {
            match link.recv().await.unwrap() {
                LinkEvent::Message { from, message } => {
                    assert_eq!(from, PeerId::COORDINATOR);
                    assert_eq!(message.payload, vec![1]);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        a.send_to(PeerId::COORDINATOR, Message::from_raw(1, vec![2]))
            .await
            .unwrap();
        match coord.recv().await.unwrap() {
            LinkEvent::Message { from, .. } => assert_eq!(from, a.local_id()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_notifies_and_closes() {
        let hub = MemoryHub::new();
        let coord = hub.coordinator();
        let a = hub.executor();
        let a_id = a.local_id();
        assert_eq!(coord.recv().await.unwrap(), LinkEvent::Connected(a_id));

        hub.disconnect(a_id);
        assert_eq!(coord.recv().await.unwrap(), LinkEvent::Disconnected(a_id));
        assert!(matches!(a.recv().await, Err(TransportError::Closed)));
        assert!(matches!(
            a.send_to(PeerId::COORDINATOR, Message::from_raw(1, vec![])).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            coord.send_to(a_id, Message::from_raw(1, vec![])).await,
            Err(TransportError::PeerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn dropping_a_link_leaves_the_hub() {
        let hub = MemoryHub::new();
        let coord = hub.coordinator();
        let a = hub.executor();
        let a_id = a.local_id();
        drop(a);

        assert_eq!(coord.recv().await.unwrap(), LinkEvent::Connected(a_id));
        assert_eq!(coord.recv().await.unwrap(), LinkEvent::Disconnected(a_id));
        assert_eq!(hub.peers(), vec![PeerId::COORDINATOR]);
    }
}
