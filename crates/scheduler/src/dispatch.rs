//! Protocol dispatcher shared by both roles.
//!
//! A [`Session`] owns the scheduler's registration on the protocol mux. It
//! decodes inbound envelopes into [`Packet`]s, tags each one as stale or
//! current for the active generation, and keeps the transfer counters in the
//! [`DistributionContext`] up to date in both directions.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use fanout_transport::{Link, LinkEvent, PeerId, ProtocolId, ProtocolMux, TransportError};

use crate::context::DistributionContext;
use crate::phase::Generation;
use crate::protocol::Packet;

/// One inbound event after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Inbound {
    Joined(PeerId),
    Left(PeerId),
    Packet {
        from: PeerId,
        packet: Packet,
        stale: bool,
    },
}

pub(crate) struct Session {
    mux: ProtocolMux,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
    protocol: ProtocolId,
    ctx: Arc<DistributionContext>,
}

impl Session {
    /// Register `protocol` on a fresh mux over `link`.
    pub(crate) fn open(
        link: Arc<dyn Link>,
        protocol: ProtocolId,
        ctx: Arc<DistributionContext>,
    ) -> Self {
        let (mux, inbound) = ProtocolMux::with_handler(link, protocol);
        Self {
            mux,
            inbound,
            protocol,
            ctx,
        }
    }

    pub(crate) fn local_id(&self) -> PeerId {
        self.mux.local_id()
    }

    pub(crate) fn ctx(&self) -> &Arc<DistributionContext> {
        &self.ctx
    }

    /// Next inbound event, classified against `current`.
    ///
    /// Undecodable envelopes are logged and skipped. Returns `None` once the
    /// link is gone.
    pub(crate) async fn next(&mut self, current: Option<Generation>) -> Option<Inbound> {
        loop {
            match self.inbound.recv().await? {
                LinkEvent::Connected(peer) => return Some(Inbound::Joined(peer)),
                LinkEvent::Disconnected(peer) => return Some(Inbound::Left(peer)),
                LinkEvent::Message { from, message } => {
                    self.ctx.record_received(message.wire_len());
                    match Packet::from_message(&message) {
                        Ok(packet) => {
                            let stale = Some(packet.generation()) != current;
                            trace!(peer = %from, kind = packet.kind(), stale, "packet received");
                            return Some(Inbound::Packet {
                                from,
                                packet,
                                stale,
                            });
                        }
                        Err(e) => warn!(peer = %from, error = %e, "dropping undecodable packet"),
                    }
                }
            }
        }
    }

    pub(crate) async fn send(&self, to: PeerId, packet: &Packet) -> Result<(), TransportError> {
        let message = packet.to_message(self.protocol)?;
        let len = message.wire_len();
        self.mux.send_to(to, message).await?;
        self.ctx.record_sent(len);
        Ok(())
    }

    pub(crate) async fn broadcast(&self, packet: &Packet) -> Result<(), TransportError> {
        let message = packet.to_message(self.protocol)?;
        let len = message.wire_len();
        self.mux.broadcast(message).await?;
        self.ctx.record_sent(len);
        Ok(())
    }
}
