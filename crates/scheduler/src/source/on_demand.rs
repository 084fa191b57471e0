use std::collections::BTreeMap;

use tracing::{debug, info};

use fanout_transport::PeerId;

use crate::phase::WorkUnitIndex;

use super::{Ledger, MasterSource, Outbox, PolicyMessage};

/// Pull policy: executors ask for work when their queue runs dry.
///
/// A request that cannot be served right away is parked and answered as
/// soon as units come back to the pending pool.
#[derive(Debug)]
pub struct OnDemandSource {
    ledger: Ledger,
    batch: usize,
    parked: BTreeMap<PeerId, usize>,
}

impl OnDemandSource {
    pub fn new(ledger: Ledger, batch: usize) -> Self {
        Self {
            ledger,
            batch: batch.max(1),
            parked: BTreeMap::new(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Workers waiting for an answer to an earlier request.
    pub fn parked(&self) -> Vec<PeerId> {
        self.parked.keys().copied().collect()
    }

    fn serve(&mut self, worker: PeerId, count: usize, outbox: &mut Outbox) {
        let units = self.ledger.assign(worker, count.clamp(1, self.batch));
        if units.is_empty() {
            debug!(worker = %worker, "nothing to hand out, parking request");
            self.parked.insert(worker, count);
        } else {
            debug!(worker = %worker, count = units.len(), "serving request");
            outbox.assign(worker, units);
        }
    }
}

impl MasterSource for OnDemandSource {
    fn on_worker_ready(&mut self, worker: PeerId, _outbox: &mut Outbox) {
        self.ledger.register(worker);
    }

    fn handle_work_unit_results(
        &mut self,
        unit: WorkUnitIndex,
        from: PeerId,
        outbox: &mut Outbox,
    ) -> bool {
        let accepted = self.ledger.accept(unit, from);
        // The worker may have become idle, which opens up tail work for it.
        if let Some(count) = self.parked.remove(&from) {
            self.serve(from, count, outbox);
        }
        accepted
    }

    fn disconnect_handler(&mut self, worker: PeerId, outbox: &mut Outbox) {
        self.parked.remove(&worker);
        let requeued = self.ledger.requeue(worker);
        if requeued > 0 {
            info!(worker = %worker, requeued, "requeued units of lost worker");
        }
        for (parked, count) in std::mem::take(&mut self.parked) {
            self.serve(parked, count, outbox);
        }
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
            Ok(PolicyMessage::Request { count }) => {
                if self.ledger.is_ready(from) {
                    self.serve(from, count as usize, outbox);
                } else {
                    debug!(worker = %from, "request from a worker that is not ready");
                }
                true
            }
            Ok(PolicyMessage::Assign { .. }) => false,
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
        self.parked.clear();
        self.ledger = Ledger::new(0, false);
    }
}
