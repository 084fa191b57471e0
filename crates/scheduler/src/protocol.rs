//! Scheduler packets carried inside the transport envelope.

use serde::{Deserialize, Serialize};

use fanout_transport::{Message, ProtocolId, TransportError};

use crate::phase::{Generation, WorkUnitIndex};

/// Every packet the scheduler exchanges. Each one names the generation it
/// belongs to so stale traffic can be recognised and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Coordinator → all: a phase has started.
    Ready {
        generation: Generation,
        unit_count: u64,
    },
    /// Executor → coordinator: ready to receive work for the phase.
    WorkerReady { generation: Generation },
    /// Coordinator → all: every unit is accounted for.
    Finished { generation: Generation },
    /// Executor → coordinator: advisory, a thread picked up `unit`.
    Started {
        generation: Generation,
        unit: WorkUnitIndex,
    },
    /// Executor → coordinator: output of one unit.
    Results {
        generation: Generation,
        unit: WorkUnitIndex,
        payload: Vec<u8>,
    },
    /// Either direction: opaque scheduling-policy traffic.
    Control {
        generation: Generation,
        payload: Vec<u8>,
    },
}

impl Packet {
    pub fn generation(&self) -> Generation {
        match self {
            Packet::Ready { generation, .. }
            | Packet::WorkerReady { generation }
            | Packet::Finished { generation }
            | Packet::Started { generation, .. }
            | Packet::Results { generation, .. }
            | Packet::Control { generation, .. } => *generation,
        }
    }

    /// Short name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Ready { .. } => "ready",
            Packet::WorkerReady { .. } => "worker_ready",
            Packet::Finished { .. } => "finished",
            Packet::Started { .. } => "started",
            Packet::Results { .. } => "results",
            Packet::Control { .. } => "control",
        }
    }

    pub fn to_message(&self, protocol: ProtocolId) -> Result<Message, TransportError> {
        Ok(Message::new(protocol, self)?)
    }

    pub fn from_message(message: &Message) -> Result<Self, TransportError> {
        Ok(message.decode()?)
    }
}
