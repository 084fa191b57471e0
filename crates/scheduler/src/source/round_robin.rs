use std::collections::BTreeMap;

use tracing::{debug, info};

use fanout_transport::PeerId;

use crate::phase::WorkUnitIndex;

use super::{Ledger, MasterSource, Outbox, PolicyMessage};

/// Push policy: every ready worker is kept stocked with a batch of units.
///
/// A worker gets `batch` units when it announces readiness and one more for
/// every result it reports. Units requeued after a disconnect are dealt one
/// at a time across the ready workers.
#[derive(Debug)]
pub struct RoundRobinSource {
    ledger: Ledger,
    batch: usize,
}

impl RoundRobinSource {
    pub fn new(ledger: Ledger, batch: usize) -> Self {
        Self {
            ledger,
            batch: batch.max(1),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn top_up(&mut self, worker: PeerId, outbox: &mut Outbox) {
        let room = self.ledger.room(worker, self.batch);
        if room == 0 {
            return;
        }
        let units = self.ledger.assign(worker, room);
        if !units.is_empty() {
            debug!(worker = %worker, count = units.len(), "assigning units");
        }
        outbox.assign(worker, units);
    }

    /// Spread pending units over ready workers one at a time.
    fn deal(&mut self, outbox: &mut Outbox) {
        let workers = self.ledger.ready_workers();
        let mut grants: BTreeMap<PeerId, Vec<WorkUnitIndex>> = BTreeMap::new();
        loop {
            let mut dealt = false;
            for worker in &workers {
                if self.ledger.room(*worker, self.batch) == 0 {
                    continue;
                }
                let units = self.ledger.take_pending(*worker, 1);
                if !units.is_empty() {
                    grants.entry(*worker).or_default().extend(units);
                    dealt = true;
                }
            }
            if !dealt {
                break;
            }
        }
        for (worker, units) in grants {
            outbox.assign(worker, units);
        }
        // Whoever is still idle may pick up tail work.
        for worker in workers {
            if self.ledger.worker(worker).is_some_and(|r| r.assigned.is_empty()) {
                self.top_up(worker, outbox);
            }
        }
    }
}

impl MasterSource for RoundRobinSource {
    fn on_worker_ready(&mut self, worker: PeerId, outbox: &mut Outbox) {
        self.ledger.register(worker);
        self.top_up(worker, outbox);
    }

    fn handle_work_unit_results(
        &mut self,
        unit: WorkUnitIndex,
        from: PeerId,
        outbox: &mut Outbox,
    ) -> bool {
        let accepted = self.ledger.accept(unit, from);
        if self.ledger.is_ready(from) {
            self.top_up(from, outbox);
        }
        accepted
    }

    fn disconnect_handler(&mut self, worker: PeerId, outbox: &mut Outbox) {
        let requeued = self.ledger.requeue(worker);
        if requeued > 0 {
            info!(worker = %worker, requeued, "requeued units of lost worker");
        }
        self.deal(outbox);
    }

    fn handle_packet(
        &mut self,
        payload: &[u8],
        from: PeerId,
        is_stale: bool,
        outbox: &mut Outbox,
    ) -> bool {
        if is_stale {
            return true;
        }
        match PolicyMessage::decode(payload) {
            // Push workers never need to ask, but a request is harmless.
            Ok(PolicyMessage::Request { .. }) if self.ledger.is_ready(from) => {
                self.top_up(from, outbox);
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!(worker = %from, error = %e, "undecodable control payload");
                false
            }
        }
    }

    fn completed(&self) -> u64 {
        self.ledger.completed()
    }

    fn release(&mut self) {
        self.ledger = Ledger::new(0, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Outbound;

    const A: PeerId = PeerId(1);
    const B: PeerId = PeerId(2);

    fn assigned(outbox: &mut Outbox) -> Vec<(PeerId, Vec<WorkUnitIndex>)> {
        outbox
            .drain()
            .map(|Outbound { to, message }| match message {
                PolicyMessage::Assign { units } => (to, units),
                other => panic!("unexpected message {other:?}"),
            })
            .collect()
    }

    #[test]
    fn ready_workers_get_a_batch_each() {
        let mut source = RoundRobinSource::new(Ledger::new(10, true), 4);
        let mut outbox = Outbox::default();
        source.on_worker_ready(A, &mut outbox);
        source.on_worker_ready(B, &mut outbox);
        assert_eq!(
            assigned(&mut outbox),
            vec![(A, vec![0, 1, 2, 3]), (B, vec![4, 5, 6, 7])]
        );
    }

    #[test]
    fn each_result_tops_up_by_one() {
        let mut source = RoundRobinSource::new(Ledger::new(6, true), 4);
        let mut outbox = Outbox::default();
        source.on_worker_ready(A, &mut outbox);
        outbox.drain();

        assert!(source.handle_work_unit_results(0, A, &mut outbox));
        assert_eq!(assigned(&mut outbox), vec![(A, vec![4])]);
        assert!(!source.handle_work_unit_results(0, A, &mut outbox));
        assert_eq!(source.completed(), 1);
    }

    #[test]
    fn disconnect_deals_units_to_survivors() {
        let mut source = RoundRobinSource::new(Ledger::new(10, false), 5);
        let mut outbox = Outbox::default();
        source.on_worker_ready(A, &mut outbox);
        source.on_worker_ready(B, &mut outbox);
        outbox.drain();

        for unit in 0..5 {
            assert!(source.handle_work_unit_results(unit, A, &mut outbox));
        }
        assert!(outbox.is_empty());

        source.disconnect_handler(B, &mut outbox);
        assert_eq!(assigned(&mut outbox), vec![(A, vec![5, 6, 7, 8, 9])]);
        assert!(source.ledger().worker(B).is_none());
    }

    #[test]
    fn stale_control_is_consumed_without_effect() {
        let mut source = RoundRobinSource::new(Ledger::new(4, true), 2);
        let mut outbox = Outbox::default();
        let request = PolicyMessage::Request { count: 2 }.encode().unwrap();
        assert!(source.handle_packet(&request, A, true, &mut outbox));
        assert!(outbox.is_empty());
        // Not ready yet, so a live request is not ours to answer.
        assert!(!source.handle_packet(&request, A, false, &mut outbox));
    }
}
