use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use fanout_transport::PeerId;

use crate::error::SchedulerError;
use crate::phase::{ClaimTable, WorkUnitIndex};
use crate::pool::ExecutorEvent;

use super::{PolicyMessage, WorkerSource};

/// Executor-side queue of assigned units, shared by all worker threads.
///
/// In push mode the queue is filled by unsolicited assignments. In pull mode
/// an empty queue triggers a single outstanding request to the coordinator.
#[derive(Debug)]
pub struct QueueWorkerSource {
    unit_count: u64,
    queue: Mutex<VecDeque<WorkUnitIndex>>,
    computed: Mutex<HashSet<WorkUnitIndex>>,
    request_batch: Option<u32>,
    request_outstanding: AtomicBool,
    events: mpsc::UnboundedSender<ExecutorEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl QueueWorkerSource {
    /// Queue filled by the coordinator without being asked.
    pub fn push(unit_count: u64, events: mpsc::UnboundedSender<ExecutorEvent>) -> Self {
        Self::new(unit_count, None, events)
    }

    /// Queue that asks the coordinator for `batch` units when it runs dry.
    pub fn pull(
        unit_count: u64,
        batch: usize,
        events: mpsc::UnboundedSender<ExecutorEvent>,
    ) -> Self {
        let batch = u32::try_from(batch.max(1)).unwrap_or(u32::MAX);
        Self::new(unit_count, Some(batch), events)
    }

    fn new(
        unit_count: u64,
        request_batch: Option<u32>,
        events: mpsc::UnboundedSender<ExecutorEvent>,
    ) -> Self {
        Self {
            unit_count,
            queue: Mutex::new(VecDeque::new()),
            computed: Mutex::new(HashSet::new()),
            request_batch,
            request_outstanding: AtomicBool::new(false),
            events,
        }
    }

    /// Units waiting for a thread.
    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    fn request_more(&self) {
        let Some(count) = self.request_batch else {
            return;
        };
        if self.request_outstanding.swap(true, Ordering::AcqRel) {
            return;
        }
        match (PolicyMessage::Request { count }).encode() {
            Ok(bytes) => {
                trace!(count, "requesting units");
                if self.events.send(ExecutorEvent::Control(bytes)).is_err() {
                    debug!("event channel closed, request not sent");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode request"),
        }
    }
}

impl WorkerSource for QueueWorkerSource {
    fn get_next_work_unit(
        &self,
        thread: usize,
        claims: &ClaimTable,
    ) -> Result<Option<WorkUnitIndex>, SchedulerError> {
        {
            let mut queue = lock(&self.queue);
            let computed = lock(&self.computed);
            while let Some(unit) = queue.pop_front() {
                if unit >= self.unit_count || computed.contains(&unit) || claims.contains(unit) {
                    trace!(unit, "skipping unit already handled locally");
                    continue;
                }
                // Claimed under the queue lock so a repeated assignment
                // cannot hand the same unit to a second thread.
                claims.claim(thread, unit)?;
                return Ok(Some(unit));
            }
        }
        self.request_more();
        Ok(None)
    }

    fn rejoined(&self) {
        self.request_outstanding.store(false, Ordering::Release);
    }

    fn note_local_work_unit_completed(&self, unit: WorkUnitIndex) {
        lock(&self.computed).insert(unit);
    }

    fn handle_packet(&self, payload: &[u8], from: PeerId, is_stale: bool) -> bool {
        if is_stale {
            return true;
        }
        match PolicyMessage::decode(payload) {
            Ok(PolicyMessage::Assign { units }) => {
                let mut queue = lock(&self.queue);
                let computed = lock(&self.computed);
                for unit in units {
                    if !computed.contains(&unit) && !queue.contains(&unit) {
                        queue.push_back(unit);
                    }
                }
                self.request_outstanding.store(false, Ordering::Release);
                true
            }
            Ok(PolicyMessage::Request { .. }) => false,
            Err(e) => {
                debug!(peer = %from, error = %e, "undecodable control payload");
                false
            }
        }
    }

    fn release(&self) {
        lock(&self.queue).clear();
        lock(&self.computed).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign(units: Vec<WorkUnitIndex>) -> Vec<u8> {
        PolicyMessage::Assign { units }.encode().unwrap()
    }

    #[test]
    fn hands_out_assigned_units_in_order() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let source = QueueWorkerSource::push(10, tx);
        let claims = ClaimTable::new(2);
        assert!(source.handle_packet(&assign(vec![3, 7]), PeerId::COORDINATOR, false));

        assert_eq!(source.get_next_work_unit(0, &claims).unwrap(), Some(3));
        assert_eq!(source.get_next_work_unit(1, &claims).unwrap(), Some(7));
        assert_eq!(claims.in_flight(), vec![3, 7]);
        claims.release(0);
        assert_eq!(source.get_next_work_unit(0, &claims).unwrap(), None);
    }

    #[test]
    fn never_returns_claimed_or_computed_units() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let source = QueueWorkerSource::push(10, tx);
        let claims = ClaimTable::new(2);
        claims.claim(0, 1).unwrap();
        source.note_local_work_unit_completed(2);
        source.handle_packet(&assign(vec![1, 2, 4, 4, 42]), PeerId::COORDINATOR, false);

        assert_eq!(source.get_next_work_unit(1, &claims).unwrap(), Some(4));
        claims.release(1);
        assert_eq!(source.get_next_work_unit(1, &claims).unwrap(), None);
    }

    #[test]
    fn repeated_assignment_never_reaches_a_second_thread() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let source = QueueWorkerSource::push(10, tx);
        let claims = ClaimTable::new(2);
        source.handle_packet(&assign(vec![3]), PeerId::COORDINATOR, false);
        assert_eq!(source.get_next_work_unit(0, &claims).unwrap(), Some(3));
        assert_eq!(claims.holder(0), Some(3));

        // The coordinator hands the same unit out again while thread 0 is on it.
        source.handle_packet(&assign(vec![3]), PeerId::COORDINATOR, false);
        assert_eq!(source.get_next_work_unit(1, &claims).unwrap(), None);
        assert_eq!(claims.holder(1), None);
    }

    #[test]
    fn stale_assignments_are_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let source = QueueWorkerSource::push(10, tx);
        assert!(source.handle_packet(&assign(vec![1]), PeerId::COORDINATOR, true));
        assert_eq!(source.queued(), 0);
    }

    #[test]
    fn pull_mode_keeps_one_request_outstanding() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = QueueWorkerSource::pull(10, 4, tx);
        let claims = ClaimTable::new(1);

        assert_eq!(source.get_next_work_unit(0, &claims).unwrap(), None);
        assert_eq!(source.get_next_work_unit(0, &claims).unwrap(), None);
        match rx.try_recv().unwrap() {
            ExecutorEvent::Control(bytes) => {
                assert_eq!(PolicyMessage::decode(&bytes).unwrap(), PolicyMessage::Request { count: 4 });
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        source.handle_packet(&assign(vec![0]), PeerId::COORDINATOR, false);
        assert_eq!(source.get_next_work_unit(0, &claims).unwrap(), Some(0));
        claims.release(0);
        assert_eq!(source.get_next_work_unit(0, &claims).unwrap(), None);
        assert!(matches!(rx.try_recv().unwrap(), ExecutorEvent::Control(_)));
    }

    #[test]
    fn rejoining_allows_a_fresh_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = QueueWorkerSource::pull(10, 2, tx);
        let claims = ClaimTable::new(1);

        assert_eq!(source.get_next_work_unit(0, &claims).unwrap(), None);
        assert!(matches!(rx.try_recv().unwrap(), ExecutorEvent::Control(_)));
        assert_eq!(source.get_next_work_unit(0, &claims).unwrap(), None);
        assert!(rx.try_recv().is_err());

        source.rejoined();
        assert_eq!(source.get_next_work_unit(0, &claims).unwrap(), None);
        assert!(matches!(rx.try_recv().unwrap(), ExecutorEvent::Control(_)));
    }
}
