use std::collections::{BTreeMap, BTreeSet, VecDeque};

use fanout_transport::PeerId;

use crate::phase::WorkUnitIndex;

/// What the coordinator knows about one executor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    pub ready: bool,
    /// Units handed to this worker and not yet confirmed.
    pub assigned: BTreeSet<WorkUnitIndex>,
    /// Results accepted from this worker.
    pub accepted: u64,
}

/// Assignment bookkeeping shared by the built-in master sources.
#[derive(Debug)]
pub struct Ledger {
    pending: VecDeque<WorkUnitIndex>,
    completed: Vec<bool>,
    completed_count: u64,
    workers: BTreeMap<PeerId, WorkerRecord>,
    redistribute_tail: bool,
}

impl Ledger {
    pub fn new(unit_count: u64, redistribute_tail: bool) -> Self {
        Self {
            pending: (0..unit_count).collect(),
            completed: vec![false; unit_count as usize],
            completed_count: 0,
            workers: BTreeMap::new(),
            redistribute_tail,
        }
    }

    pub fn unit_count(&self) -> u64 {
        self.completed.len() as u64
    }

    pub fn completed(&self) -> u64 {
        self.completed_count
    }

    pub fn is_completed(&self, unit: WorkUnitIndex) -> bool {
        self.completed.get(unit as usize).copied().unwrap_or(false)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn worker(&self, worker: PeerId) -> Option<&WorkerRecord> {
        self.workers.get(&worker)
    }

    pub fn is_ready(&self, worker: PeerId) -> bool {
        self.workers.get(&worker).is_some_and(|r| r.ready)
    }

    pub fn ready_workers(&self) -> Vec<PeerId> {
        self.workers
            .iter()
            .filter(|(_, r)| r.ready)
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn register(&mut self, worker: PeerId) {
        self.workers.entry(worker).or_default().ready = true;
    }

    /// Free slots in `worker`'s batch of size `batch`.
    pub fn room(&self, worker: PeerId, batch: usize) -> usize {
        self.workers
            .get(&worker)
            .map(|r| batch.saturating_sub(r.assigned.len()))
            .unwrap_or(0)
    }

    /// Hand up to `n` units to `worker`: pending units first, then (if the
    /// worker is idle and nothing is pending) units in flight elsewhere.
    pub fn assign(&mut self, worker: PeerId, n: usize) -> Vec<WorkUnitIndex> {
        let mut units = self.take_pending(worker, n);
        if units.is_empty() {
            units = self.take_tail(worker, n);
        }
        units
    }

    /// Pop up to `n` pending units into `worker`'s record.
    pub fn take_pending(&mut self, worker: PeerId, n: usize) -> Vec<WorkUnitIndex> {
        let Some(record) = self.workers.get_mut(&worker) else {
            return Vec::new();
        };
        let mut units = Vec::new();
        while units.len() < n {
            let Some(unit) = self.pending.pop_front() else {
                break;
            };
            if self.completed[unit as usize] {
                continue;
            }
            if record.assigned.insert(unit) {
                units.push(unit);
            }
        }
        units
    }

    /// Give an idle worker units that other workers still hold, least
    /// duplicated first. Only applies once the pending pool is empty.
    fn take_tail(&mut self, worker: PeerId, n: usize) -> Vec<WorkUnitIndex> {
        if !self.redistribute_tail || n == 0 || !self.pending.is_empty() {
            return Vec::new();
        }
        match self.workers.get(&worker) {
            Some(record) if record.assigned.is_empty() => {}
            _ => return Vec::new(),
        }

        let mut holders: BTreeMap<WorkUnitIndex, usize> = BTreeMap::new();
        for (peer, record) in &self.workers {
            if *peer == worker {
                continue;
            }
            for unit in &record.assigned {
                *holders.entry(*unit).or_default() += 1;
            }
        }
        let mut candidates: Vec<(usize, WorkUnitIndex)> = holders
            .into_iter()
            .filter(|(unit, _)| !self.completed[*unit as usize])
            .map(|(unit, count)| (count, unit))
            .collect();
        candidates.sort_unstable();

        let units: Vec<WorkUnitIndex> = candidates.into_iter().take(n).map(|(_, u)| u).collect();
        if let Some(record) = self.workers.get_mut(&worker) {
            record.assigned.extend(units.iter().copied());
        }
        units
    }

    /// Mark `unit` completed. Returns `false` if it already was or is out of
    /// range; either way `from` no longer holds it.
    pub fn accept(&mut self, unit: WorkUnitIndex, from: PeerId) -> bool {
        let Some(done) = self.completed.get_mut(unit as usize) else {
            return false;
        };
        if *done {
            if let Some(record) = self.workers.get_mut(&from) {
                record.assigned.remove(&unit);
            }
            return false;
        }
        *done = true;
        self.completed_count += 1;
        for record in self.workers.values_mut() {
            record.assigned.remove(&unit);
        }
        if let Some(record) = self.workers.get_mut(&from) {
            record.accepted += 1;
        }
        true
    }

    /// Forget `worker` and put its unconfirmed units at the front of the
    /// pending pool. Returns how many units were requeued.
    pub fn requeue(&mut self, worker: PeerId) -> usize {
        let Some(record) = self.workers.remove(&worker) else {
            return 0;
        };
        let mut requeued = 0;
        for unit in record.assigned.into_iter().rev() {
            if !self.completed[unit as usize] {
                self.pending.push_front(unit);
                requeued += 1;
            }
        }
        requeued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: PeerId = PeerId(1);
    const B: PeerId = PeerId(2);

    #[test]
    fn assigns_pending_in_order() {
        let mut ledger = Ledger::new(6, true);
        ledger.register(A);
        assert_eq!(ledger.assign(A, 4), vec![0, 1, 2, 3]);
        assert_eq!(ledger.room(A, 4), 0);
        assert_eq!(ledger.pending_len(), 2);
    }

    #[test]
    fn accept_is_idempotent() {
        let mut ledger = Ledger::new(3, true);
        ledger.register(A);
        ledger.assign(A, 3);
        assert!(ledger.accept(1, A));
        assert!(!ledger.accept(1, A));
        assert!(!ledger.accept(1, B));
        assert!(!ledger.accept(9, A));
        assert_eq!(ledger.completed(), 1);
        assert_eq!(ledger.worker(A).unwrap().accepted, 1);
    }

    #[test]
    fn requeue_skips_completed_units() {
        let mut ledger = Ledger::new(10, true);
        ledger.register(A);
        ledger.register(B);
        ledger.assign(A, 5);
        assert_eq!(ledger.assign(B, 5), vec![5, 6, 7, 8, 9]);
        ledger.accept(6, B);

        assert_eq!(ledger.requeue(B), 4);
        assert!(!ledger.is_ready(B));
        assert_eq!(ledger.take_pending(A, 10), vec![5, 7, 8, 9]);
        assert_eq!(ledger.completed(), 1);
    }

    #[test]
    fn idle_worker_gets_tail_units() {
        let mut ledger = Ledger::new(4, true);
        ledger.register(A);
        ledger.register(B);
        ledger.assign(A, 4);
        assert_eq!(ledger.assign(B, 2), vec![0, 1]);
        // B is busy now, so no more tail work for it.
        assert!(ledger.assign(B, 2).is_empty());

        assert!(ledger.accept(0, B));
        assert!(!ledger.accept(0, A));
        assert!(ledger.worker(A).unwrap().assigned.contains(&1));
        assert!(!ledger.worker(B).unwrap().assigned.contains(&0));
    }

    #[test]
    fn tail_can_be_disabled() {
        let mut ledger = Ledger::new(2, false);
        ledger.register(A);
        ledger.register(B);
        ledger.assign(A, 2);
        assert!(ledger.assign(B, 2).is_empty());
    }
}
