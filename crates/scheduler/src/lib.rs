//! Distributed work-unit scheduler.
//!
//! One coordinator fans a fixed number of independent units out to executor
//! processes over a long-lived [`Link`](fanout_transport::Link), accepts the
//! first result for every unit, and survives executors dropping out mid-phase
//! by handing their units to someone else. The same link carries any number
//! of sequential phases, each tagged with its own [`Generation`].

pub mod config;
pub mod context;
mod coordinator;
mod dispatch;
pub mod distributor;
pub mod error;
mod executor;
pub mod phase;
pub mod pool;
pub mod protocol;
pub mod source;
pub mod telemetry;
pub mod work;

pub use config::{FanoutConfig, SchedulerConfig, SchedulingPolicy};
pub use context::DistributionContext;
pub use distributor::Distributor;
pub use error::SchedulerError;
pub use phase::{
    ClaimTable, Generation, GenerationCounter, PhaseReport, Role, WorkUnitIndex, MAX_GENERATIONS,
};
pub use pool::{ExecutorEvent, ExecutorPool, PoolSettings};
pub use protocol::Packet;
pub use source::{
    Ledger, MasterSource, OnDemandSource, Outbox, PolicyMessage, QueueWorkerSource,
    RoundRobinSource, WorkerRecord, WorkerSource,
};
pub use telemetry::{ChannelSink, StatsSample, TelemetrySink, TracingSink};
pub use work::{DiscardResults, ProcessError, WorkProcessor, WorkReceiver};
