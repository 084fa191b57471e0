//! Work-unit sources: the pluggable policy deciding who computes what.
//!
//! A policy has two halves. The [`MasterSource`] lives on the coordinator and
//! owns the assignment ledger; it is driven by a single task and never shared.
//! The [`WorkerSource`] lives on each executor and is called concurrently by
//! every worker thread in its pool.
//!
//! Policy traffic (assignments, requests) travels as opaque
//! [`Packet::Control`](crate::protocol::Packet::Control) payloads.

mod ledger;
mod local_queue;
mod on_demand;
mod round_robin;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use fanout_transport::PeerId;

use crate::config::{SchedulerConfig, SchedulingPolicy};
use crate::error::SchedulerError;
use crate::phase::{ClaimTable, WorkUnitIndex};
use crate::pool::ExecutorEvent;

pub use ledger::{Ledger, WorkerRecord};
pub use local_queue::QueueWorkerSource;
pub use on_demand::OnDemandSource;
pub use round_robin::RoundRobinSource;

/// Control payloads exchanged by the built-in policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyMessage {
    /// Coordinator → executor: add these units to your queue.
    Assign { units: Vec<WorkUnitIndex> },
    /// Executor → coordinator: my queue is empty, send up to `count` units.
    Request { count: u32 },
}

impl PolicyMessage {
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// A policy message addressed to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: PeerId,
    pub message: PolicyMessage,
}

/// Messages produced by [`MasterSource`] hooks, flushed by the coordinator
/// after each hook returns.
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<Outbound>,
}

impl Outbox {
    pub fn push(&mut self, to: PeerId, message: PolicyMessage) {
        self.items.push(Outbound { to, message });
    }

    pub fn assign(&mut self, to: PeerId, units: Vec<WorkUnitIndex>) {
        if !units.is_empty() {
            self.push(to, PolicyMessage::Assign { units });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Outbound> {
        self.items.drain(..)
    }
}

/// Coordinator half of a scheduling policy.
pub trait MasterSource: Send {
    /// An executor announced readiness for the active phase.
    fn on_worker_ready(&mut self, worker: PeerId, outbox: &mut Outbox);

    /// Results for `unit` arrived from `from`.
    ///
    /// Returns `true` the first time a unit is accepted and `false` for every
    /// later result for it.
    fn handle_work_unit_results(
        &mut self,
        unit: WorkUnitIndex,
        from: PeerId,
        outbox: &mut Outbox,
    ) -> bool;

    /// `worker` left the link. Its unconfirmed units go back to pending.
    fn disconnect_handler(&mut self, worker: PeerId, outbox: &mut Outbox);

    /// Policy-specific control traffic. Returns whether it was consumed.
    fn handle_packet(
        &mut self,
        payload: &[u8],
        from: PeerId,
        is_stale: bool,
        outbox: &mut Outbox,
    ) -> bool;

    /// Units accepted so far.
    fn completed(&self) -> u64;

    /// Drop policy-private state. Called once when the phase ends.
    fn release(&mut self);
}

/// Executor half of a scheduling policy. Shared by every worker thread.
pub trait WorkerSource: Send + Sync {
    /// Next unit for local thread `thread`, or `None` if nothing is
    /// available yet.
    ///
    /// A returned unit is already claimed for `thread` in `claims`, so no
    /// other thread can receive it until the claim is released.
    fn get_next_work_unit(
        &self,
        thread: usize,
        claims: &ClaimTable,
    ) -> Result<Option<WorkUnitIndex>, SchedulerError>;

    /// A local thread finished computing `unit`; its results are about to ship.
    fn note_local_work_unit_completed(&self, unit: WorkUnitIndex);

    /// Policy-specific control traffic. Returns whether it was consumed.
    fn handle_packet(&self, payload: &[u8], from: PeerId, is_stale: bool) -> bool;

    /// The coordinator admitted this process again under a new id. Forget
    /// anything still waiting on an answer addressed to the old one.
    fn rejoined(&self) {}

    /// Drop policy-private state. Called once when the phase ends.
    fn release(&self);
}

impl SchedulingPolicy {
    /// Coordinator half of this policy for a phase of `unit_count` units.
    pub fn master_source(self, unit_count: u64, config: &SchedulerConfig) -> Box<dyn MasterSource> {
        let ledger = Ledger::new(unit_count, config.redistribute_tail);
        match self {
            SchedulingPolicy::RoundRobin => {
                Box::new(RoundRobinSource::new(ledger, config.units_per_assignment))
            }
            SchedulingPolicy::OnDemand => {
                Box::new(OnDemandSource::new(ledger, config.units_per_assignment))
            }
        }
    }

    /// Executor half of this policy. Requests go out through `events`.
    pub fn worker_source(
        self,
        unit_count: u64,
        config: &SchedulerConfig,
        events: mpsc::UnboundedSender<ExecutorEvent>,
    ) -> Arc<dyn WorkerSource> {
        match self {
            SchedulingPolicy::RoundRobin => Arc::new(QueueWorkerSource::push(unit_count, events)),
            SchedulingPolicy::OnDemand => Arc::new(QueueWorkerSource::pull(
                unit_count,
                config.units_per_assignment,
                events,
            )),
        }
    }
}
