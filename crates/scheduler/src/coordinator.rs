//! Coordinator side of a phase.
//!
//! One task owns every piece of phase state: the master source, the counters
//! and the caller's receiver. Worker threads of the optional local pool talk
//! to it only through the completion channel, so nothing here needs a lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use fanout_transport::{PeerId, TransportError};

use crate::config::SchedulerConfig;
use crate::dispatch::{Inbound, Session};
use crate::error::SchedulerError;
use crate::phase::{ClaimTable, Generation, PhaseReport, Role, WorkUnitIndex};
use crate::pool::{ExecutorEvent, ExecutorPool, PoolSettings};
use crate::protocol::Packet;
use crate::source::{MasterSource, Outbox, WorkerSource};
use crate::telemetry::{StatsRecorder, TelemetrySink};
use crate::work::{WorkProcessor, WorkReceiver};

/// The coordinator's own worker threads, reporting as [`PeerId::COORDINATOR`].
struct LocalExecutor {
    source: Arc<dyn WorkerSource>,
    finished: Arc<AtomicBool>,
    pool: ExecutorPool,
}

/// Logs progress once per 10% step.
struct Progress {
    unit_count: u64,
    last_step: u64,
}

impl Progress {
    fn new(unit_count: u64) -> Self {
        Self {
            unit_count,
            last_step: 0,
        }
    }

    fn update(&mut self, generation: Generation, completed: u64) {
        if self.unit_count == 0 {
            return;
        }
        let step = completed * 10 / self.unit_count;
        if step > self.last_step {
            self.last_step = step;
            info!(
                generation = generation.0,
                completed,
                total = self.unit_count,
                "{}% complete",
                step * 10
            );
        }
    }
}

struct Phase<'a> {
    generation: Generation,
    unit_count: u64,
    master: Box<dyn MasterSource>,
    receiver: &'a mut dyn WorkReceiver,
    local: Option<LocalExecutor>,
    outbox: Outbox,
    report: PhaseReport,
    progress: Progress,
}

/// Drive one phase until every unit is accepted, then broadcast FINISHED.
#[instrument(skip_all, fields(generation = generation.0, unit_count = unit_count))]
pub(crate) async fn distribute_work_master(
    session: &mut Session,
    config: &SchedulerConfig,
    telemetry: Arc<dyn TelemetrySink>,
    generation: Generation,
    unit_count: u64,
    processor: Arc<dyn WorkProcessor>,
    receiver: &mut dyn WorkReceiver,
) -> Result<PhaseReport, SchedulerError> {
    let started = Instant::now();
    let ctx = Arc::clone(session.ctx());
    let (sent_before, received_before) = (ctx.bytes_sent(), ctx.bytes_received());
    let mut stats = StatsRecorder::new(generation, &ctx, telemetry);

    let mut phase = Phase {
        generation,
        unit_count,
        master: config.policy.master_source(unit_count, config),
        receiver,
        local: None,
        outbox: Outbox::default(),
        report: PhaseReport::new(generation, Role::Coordinator, unit_count),
        progress: Progress::new(unit_count),
    };

    info!(policy = ?config.policy, "phase starting");
    session
        .broadcast(&Packet::Ready {
            generation,
            unit_count,
        })
        .await?;

    let (local_tx, mut local_rx) = mpsc::unbounded_channel();
    if unit_count > 0 && config.local_threads > 0 {
        let source = config
            .policy
            .worker_source(unit_count, config, local_tx.clone());
        let finished = Arc::new(AtomicBool::new(false));
        let pool = ExecutorPool::start(PoolSettings {
            generation,
            unit_count,
            threads: config.local_threads,
            poll_interval: config.poll_interval(),
            source: Arc::clone(&source),
            processor,
            claims: Arc::new(ClaimTable::new(config.local_threads)),
            finished: Arc::clone(&finished),
            ctx: Arc::clone(&ctx),
            events: local_tx,
        });
        phase.local = Some(LocalExecutor {
            source,
            finished,
            pool,
        });
        phase.master.on_worker_ready(PeerId::COORDINATOR, &mut phase.outbox);
        phase.flush(session).await;
    } else {
        drop(local_tx);
    }

    let mut ticker = tokio::time::interval(config.stats_interval());
    let outcome = loop {
        if phase.master.completed() >= unit_count {
            break Ok(());
        }
        if ctx.early_exit_requested() {
            break Err(SchedulerError::EarlyExit);
        }

        tokio::select! {
            event = session.next(Some(generation)) => match event {
                Some(inbound) => phase.on_inbound(session, inbound).await,
                None => break Err(SchedulerError::Transport(TransportError::Closed)),
            },
            Some(event) = local_rx.recv() => {
                if let Err(e) = phase.on_local(event) {
                    break Err(e);
                }
                // Drain whatever else the local threads finished meanwhile.
                let mut failed = None;
                while let Ok(event) = local_rx.try_recv() {
                    if let Err(e) = phase.on_local(event) {
                        failed = Some(e);
                        break;
                    }
                }
                if let Some(e) = failed {
                    break Err(e);
                }
            }
            _ = ticker.tick() => {
                stats.sample(&ctx, phase.report.completed);
            }
        }
        phase.flush(session).await;
    };

    let finish = match outcome {
        Ok(()) => session
            .broadcast(&Packet::Finished { generation })
            .await
            .map_err(SchedulerError::from),
        Err(e) => {
            ctx.request_early_exit();
            Err(e)
        }
    };
    phase.master.release();

    let mut local_result = Ok(0);
    if let Some(local) = phase.local.take() {
        local.finished.store(true, Ordering::Release);
        local_result = local.pool.join().await;
        local.source.release();
    }
    stats.sample(&ctx, phase.report.completed);

    // A failed local thread explains the early exit better than the flag.
    local_result?;
    finish?;

    let mut report = phase.report;
    report.elapsed = started.elapsed();
    report.bytes_sent = ctx.bytes_sent() - sent_before;
    report.bytes_received = ctx.bytes_received() - received_before;

    info!(
        elapsed_ms = report.elapsed.as_millis() as u64,
        completed = report.completed,
        duplicates = report.duplicates,
        stale_dropped = report.stale_dropped,
        "phase finished"
    );
    Ok(report)
}

impl Phase<'_> {
    async fn on_inbound(&mut self, session: &Session, inbound: Inbound) {
        match inbound {
            Inbound::Joined(peer) => {
                debug!(peer = %peer, "executor joined mid-phase, sending READY");
                let ready = Packet::Ready {
                    generation: self.generation,
                    unit_count: self.unit_count,
                };
                if let Err(e) = session.send(peer, &ready).await {
                    warn!(peer = %peer, error = %e, "failed to send READY");
                }
            }
            Inbound::Left(peer) => {
                info!(peer = %peer, "executor left");
                self.master.disconnect_handler(peer, &mut self.outbox);
            }
            Inbound::Packet { from, packet, stale } => self.on_packet(from, packet, stale),
        }
    }

    fn on_packet(&mut self, from: PeerId, packet: Packet, stale: bool) {
        match packet {
            Packet::Results { .. } | Packet::Started { .. } | Packet::WorkerReady { .. }
                if stale =>
            {
                debug!(peer = %from, generation = packet.generation().0, kind = packet.kind(), "dropping stale packet");
                self.report.stale_dropped += 1;
            }
            Packet::Results { unit, payload, .. } => {
                self.on_results(unit, &payload, from);
            }
            Packet::Started { .. } => self.report.started_notices += 1,
            Packet::WorkerReady { .. } => {
                debug!(peer = %from, "executor ready");
                self.master.on_worker_ready(from, &mut self.outbox);
            }
            Packet::Ready { .. } | Packet::Finished { .. } => {
                warn!(peer = %from, kind = packet.kind(), "executor sent a coordinator packet");
            }
            Packet::Control { payload, .. } => {
                if stale {
                    self.report.stale_dropped += 1;
                }
                if !self.master.handle_packet(&payload, from, stale, &mut self.outbox) {
                    debug!(peer = %from, "control packet not handled");
                }
            }
        }
    }

    fn on_local(&mut self, event: ExecutorEvent) -> Result<(), SchedulerError> {
        match event {
            ExecutorEvent::Started { .. } => self.report.started_notices += 1,
            ExecutorEvent::Completed { unit, payload } => {
                if self.on_results(unit, &payload, PeerId::COORDINATOR) {
                    self.report.local_completed += 1;
                }
            }
            ExecutorEvent::Control(payload) => {
                self.master
                    .handle_packet(&payload, PeerId::COORDINATOR, false, &mut self.outbox);
            }
            ExecutorEvent::Failed { reason } => {
                warn!(reason, "local worker thread failed");
                return Err(SchedulerError::EarlyExit);
            }
        }
        Ok(())
    }

    fn on_results(&mut self, unit: WorkUnitIndex, payload: &[u8], from: PeerId) -> bool {
        if unit >= self.unit_count {
            warn!(peer = %from, unit, "results for a unit outside the phase");
            return false;
        }
        if self
            .master
            .handle_work_unit_results(unit, from, &mut self.outbox)
        {
            self.receiver.receive(unit, payload, from);
            self.report.completed += 1;
            *self.report.per_worker.entry(from).or_default() += 1;
            self.progress.update(self.generation, self.report.completed);
            true
        } else {
            debug!(peer = %from, unit, "duplicate results");
            self.report.duplicates += 1;
            false
        }
    }

    /// Deliver policy messages queued by the master source.
    async fn flush(&mut self, session: &Session) {
        for outbound in self.outbox.drain().collect::<Vec<_>>() {
            let payload = match outbound.message.encode() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "failed to encode policy message");
                    continue;
                }
            };
            if outbound.to.is_coordinator() {
                if let Some(local) = &self.local {
                    local.source.handle_packet(&payload, PeerId::COORDINATOR, false);
                }
                continue;
            }
            let packet = Packet::Control {
                generation: self.generation,
                payload,
            };
            // A failed send means the peer is gone; its disconnect requeues.
            if let Err(e) = session.send(outbound.to, &packet).await {
                debug!(peer = %outbound.to, error = %e, "policy message not delivered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_steps_once_per_ten_percent() {
        let mut progress = Progress::new(20);
        progress.update(Generation(1), 1);
        assert_eq!(progress.last_step, 0);
        progress.update(Generation(1), 2);
        assert_eq!(progress.last_step, 1);
        progress.update(Generation(1), 9);
        assert_eq!(progress.last_step, 4);
        progress.update(Generation(1), 20);
        assert_eq!(progress.last_step, 10);
    }

    #[test]
    fn empty_phase_never_reports_progress() {
        let mut progress = Progress::new(0);
        progress.update(Generation(1), 0);
        assert_eq!(progress.last_step, 0);
    }
}
