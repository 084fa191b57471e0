//! Per-phase state: generation ids, the in-flight claim table and the report
//! handed back to the caller of `distribute_work`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fanout_transport::PeerId;

use crate::error::SchedulerError;

/// Index of one work unit, in `0..unit_count`.
pub type WorkUnitIndex = u64;

/// Upper bound on phases per process.
pub const MAX_GENERATIONS: u32 = 255;

/// Identifies one call to `distribute_work`.
///
/// Generations start at 1 and only grow, so a packet can be matched to the
/// phase it was sent for even though every phase shares the same link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Generation(pub u32);

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "generation {}", self.0)
    }
}

/// Hands out generations and enforces [`MAX_GENERATIONS`].
#[derive(Debug, Default)]
pub struct GenerationCounter {
    last: u32,
}

impl GenerationCounter {
    /// The most recent generation handed out or adopted.
    pub fn last(&self) -> Option<Generation> {
        (self.last > 0).then_some(Generation(self.last))
    }

    /// Whether another phase can still run.
    pub fn exhausted(&self) -> bool {
        self.last >= MAX_GENERATIONS
    }

    /// Start the next phase (coordinator side).
    pub fn next(&mut self) -> Result<Generation, SchedulerError> {
        if self.exhausted() {
            return Err(SchedulerError::GenerationsExhausted {
                max: MAX_GENERATIONS,
            });
        }
        self.last += 1;
        Ok(Generation(self.last))
    }

    /// Take over a generation announced by the coordinator (executor side).
    ///
    /// Only newer generations are accepted; the caller filters older ones.
    pub fn adopt(&mut self, generation: Generation) -> Result<(), SchedulerError> {
        if generation.0 > MAX_GENERATIONS {
            return Err(SchedulerError::GenerationsExhausted {
                max: MAX_GENERATIONS,
            });
        }
        self.last = self.last.max(generation.0);
        Ok(())
    }

    /// Whether `generation` is newer than anything served so far.
    pub fn is_newer(&self, generation: Generation) -> bool {
        generation.0 > self.last
    }
}

const VACANT: u64 = u64::MAX;

/// Which unit each local worker thread is computing right now.
///
/// Slots are indexed by thread number. Reads are lock-free; a claim takes the
/// lock for the check-then-write so two threads can never hold the same unit.
#[derive(Debug)]
pub struct ClaimTable {
    slots: Vec<AtomicU64>,
    lock: Mutex<()>,
}

impl ClaimTable {
    pub fn new(threads: usize) -> Self {
        Self {
            slots: (0..threads).map(|_| AtomicU64::new(VACANT)).collect(),
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of thread slots.
    pub fn threads(&self) -> usize {
        self.slots.len()
    }

    /// Record that `thread` is now computing `unit`.
    ///
    /// Fails if the thread already holds a unit or another thread holds `unit`.
    pub fn claim(&self, thread: usize, unit: WorkUnitIndex) -> Result<(), SchedulerError> {
        let slot = self.slots.get(thread).ok_or_else(|| {
            SchedulerError::ThreadPool(format!(
                "thread {thread} outside claim table of {}",
                self.slots.len()
            ))
        })?;
        let _guard = self.guard();
        if slot.load(Ordering::Acquire) != VACANT || self.contains(unit) {
            return Err(SchedulerError::DoubleClaim { thread, unit });
        }
        slot.store(unit, Ordering::Release);
        Ok(())
    }

    /// Clear the slot of `thread`, returning the unit it held.
    pub fn release(&self, thread: usize) -> Option<WorkUnitIndex> {
        let slot = self.slots.get(thread)?;
        let _guard = self.guard();
        let unit = slot.swap(VACANT, Ordering::AcqRel);
        (unit != VACANT).then_some(unit)
    }

    /// The unit `thread` is computing, if any.
    pub fn holder(&self, thread: usize) -> Option<WorkUnitIndex> {
        let unit = self.slots.get(thread)?.load(Ordering::Acquire);
        (unit != VACANT).then_some(unit)
    }

    /// Whether any local thread is computing `unit`.
    pub fn contains(&self, unit: WorkUnitIndex) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.load(Ordering::Acquire) == unit)
    }

    /// Every unit currently in flight on this process.
    pub fn in_flight(&self) -> Vec<WorkUnitIndex> {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|unit| *unit != VACANT)
            .collect()
    }
}

/// Which side of the protocol produced a [`PhaseReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Executor,
}

/// Outcome of one `distribute_work` call.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub generation: Generation,
    pub role: Role,
    pub unit_count: u64,
    /// Wall time from READY to FINISHED as seen by this process.
    pub elapsed: Duration,
    /// Units accepted (coordinator) or results shipped (executor).
    pub completed: u64,
    /// Results rejected because the unit was already completed.
    pub duplicates: u64,
    /// STARTED notices received (coordinator) or sent (executor).
    pub started_notices: u64,
    /// Packets from another generation that were consumed and dropped.
    pub stale_dropped: u64,
    /// Units computed by this process's own threads.
    pub local_completed: u64,
    /// Accepted results per reporting peer. Coordinator only.
    pub per_worker: BTreeMap<PeerId, u64>,
    /// Payload bytes sent during this phase, envelopes excluded.
    pub bytes_sent: u64,
    /// Payload bytes received during this phase, envelopes excluded.
    pub bytes_received: u64,
}

impl PhaseReport {
    pub fn new(generation: Generation, role: Role, unit_count: u64) -> Self {
        Self {
            generation,
            role,
            unit_count,
            elapsed: Duration::ZERO,
            completed: 0,
            duplicates: 0,
            started_notices: 0,
            stale_dropped: 0,
            local_completed: 0,
            per_worker: BTreeMap::new(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}
