//! Protocol demultiplexer.
//!
//! A [`ProtocolMux`] owns the receive side of a [`Link`] and routes inbound
//! messages to per-protocol channels, so several subsystems can share one
//! connection set. Membership events (connect / disconnect) are fanned out
//! to every registered protocol.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::link::{Link, LinkEvent, PeerId};
use crate::message::{Message, ProtocolId};

type Routes = Arc<RwLock<HashMap<ProtocolId, mpsc::UnboundedSender<LinkEvent>>>>;

/// Routes link events to handlers registered by protocol id.
pub struct ProtocolMux {
    link: Arc<dyn Link>,
    routes: Routes,
    pump: JoinHandle<()>,
}

impl ProtocolMux {
    /// Take over the receive side of `link` and start routing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(link: Arc<dyn Link>) -> Self {
        Self::start(link, HashMap::new())
    }

    /// Like [`ProtocolMux::new`], but with a handler for `protocol` in place
    /// before the first event is read, so nothing sent early is dropped.
    pub fn with_handler(
        link: Arc<dyn Link>,
        protocol: ProtocolId,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mux = Self::start(link, HashMap::from([(protocol, tx)]));
        (mux, rx)
    }

    fn start(
        link: Arc<dyn Link>,
        routes: HashMap<ProtocolId, mpsc::UnboundedSender<LinkEvent>>,
    ) -> Self {
        let routes: Routes = Arc::new(RwLock::new(routes));
        let pump_link = Arc::clone(&link);
        let pump_routes = Arc::clone(&routes);
        let pump = tokio::spawn(async move {
            Self::pump(pump_link, pump_routes).await;
        });
        Self { link, routes, pump }
    }

    /// Register a handler for `protocol`, replacing any previous one.
    ///
    /// The returned receiver yields messages tagged with `protocol` plus every
    /// connect / disconnect event. It ends when the link closes.
    pub fn register(&self, protocol: ProtocolId) -> mpsc::UnboundedReceiver<LinkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.routes.write() {
            Ok(mut routes) => {
                if routes.insert(protocol, tx).is_some() {
                    debug!(protocol, "replaced protocol handler");
                }
            }
            Err(e) => warn!(protocol, error = %e, "route table poisoned, handler not registered"),
        }
        rx
    }

    /// Stop routing `protocol`. Later messages for it are dropped.
    pub fn unregister(&self, protocol: ProtocolId) {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(&protocol);
        }
    }

    /// The id this process is known by on the underlying link.
    pub fn local_id(&self) -> PeerId {
        self.link.local_id()
    }

    /// Deliver a message to a single peer.
    pub async fn send_to(&self, peer: PeerId, message: Message) -> Result<(), TransportError> {
        self.link.send_to(peer, message).await
    }

    /// Deliver a message to every connected peer.
    pub async fn broadcast(&self, message: Message) -> Result<(), TransportError> {
        self.link.broadcast(message).await
    }

    /// Shared handle to the underlying link.
    pub fn link(&self) -> Arc<dyn Link> {
        Arc::clone(&self.link)
    }

    async fn pump(link: Arc<dyn Link>, routes: Routes) {
        loop {
            match link.recv().await {
                Ok(LinkEvent::Message { from, message }) => {
                    let protocol = message.protocol;
                    let delivered = routes
                        .read()
                        .ok()
                        .and_then(|r| r.get(&protocol).cloned())
                        .map(|tx| tx.send(LinkEvent::Message { from, message }).is_ok())
                        .unwrap_or(false);
                    if !delivered {
                        trace!(protocol, peer = %from, "no handler for protocol, message dropped");
                    }
                }
                Ok(event) => {
                    debug!(?event, "membership event");
                    if let Ok(routes) = routes.read() {
                        for tx in routes.values() {
                            let _ = tx.send(event.clone());
                        }
                    }
                }
                Err(TransportError::Closed) => {
                    debug!("link closed, protocol mux stopping");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "link receive failed");
                }
            }
        }
        // Dropping the senders ends every registered receiver.
        if let Ok(mut routes) = routes.write() {
            routes.clear();
        }
    }
}

impl Drop for ProtocolMux {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHub;

    #[tokio::test]
    async fn routes_by_protocol_and_fans_out_membership() {
        let hub = MemoryHub::new();
        let exec = hub.executor();
        let exec_id = exec.local_id();
        let coord = Arc::new(hub.coordinator());

        let mux = ProtocolMux::new(coord);
        let mut sched = mux.register(1);
        let mut other = mux.register(2);

        exec.send_to(PeerId::COORDINATOR, Message::from_raw(1, vec![9]))
            .await
            .unwrap();
        exec.send_to(PeerId::COORDINATOR, Message::from_raw(2, vec![8]))
            .await
            .unwrap();

        match sched.recv().await.unwrap() {
            LinkEvent::Message { from, message } => {
                assert_eq!(from, exec_id);
                assert_eq!(message.payload, vec![9]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match other.recv().await.unwrap() {
            LinkEvent::Message { message, .. } => assert_eq!(message.payload, vec![8]),
            other => panic!("unexpected event {other:?}"),
        }

        hub.disconnect(exec_id);
        assert_eq!(sched.recv().await.unwrap(), LinkEvent::Disconnected(exec_id));
        assert_eq!(other.recv().await.unwrap(), LinkEvent::Disconnected(exec_id));
    }

    #[tokio::test]
    async fn early_messages_reach_the_initial_handler() {
        let hub = MemoryHub::new();
        let exec = hub.executor();
        let coord = Arc::new(hub.coordinator());
        exec.send_to(PeerId::COORDINATOR, Message::from_raw(4, vec![1]))
            .await
            .unwrap();

        let (_mux, mut rx) = ProtocolMux::with_handler(coord, 4);
        assert!(matches!(
            rx.recv().await.unwrap(),
            LinkEvent::Message { .. }
        ));
    }

    #[tokio::test]
    async fn unregistered_protocol_is_dropped() {
        let hub = MemoryHub::new();
        let exec = hub.executor();
        let coord = Arc::new(hub.coordinator());

        let mux = ProtocolMux::new(coord);
        let mut sched = mux.register(1);
        mux.unregister(1);
        let mut sched_again = mux.register(1);

        exec.send_to(PeerId::COORDINATOR, Message::from_raw(1, vec![1]))
            .await
            .unwrap();
        assert!(matches!(
            sched_again.recv().await.unwrap(),
            LinkEvent::Message { .. }
        ));
        // The first receiver lost its sender on unregister.
        assert!(sched.recv().await.is_none());
    }
}
