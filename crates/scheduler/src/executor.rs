//! Executor side of a phase.
//!
//! Waits for READY, answers with WORKER_READY, runs the worker pool and
//! forwards whatever the pool produces until FINISHED for the same
//! generation arrives. Returning right after FINISHED leaves any traffic for
//! the next generation queued for the next call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use fanout_transport::PeerId;

use crate::config::SchedulerConfig;
use crate::dispatch::{Inbound, Session};
use crate::error::SchedulerError;
use crate::phase::{ClaimTable, Generation, GenerationCounter, PhaseReport, Role};
use crate::pool::{ExecutorEvent, ExecutorPool, PoolSettings};
use crate::protocol::Packet;
use crate::source::WorkerSource;
use crate::telemetry::{StatsRecorder, TelemetrySink};
use crate::work::WorkProcessor;

/// Block until the coordinator announces a generation newer than any served.
async fn await_ready(
    session: &mut Session,
    generations: &GenerationCounter,
    config: &SchedulerConfig,
    stale_dropped: &mut u64,
) -> Result<(Generation, u64), SchedulerError> {
    let last = generations.last().unwrap_or(Generation(0));
    let ctx = Arc::clone(session.ctx());
    let mut ticker = tokio::time::interval(config.stats_interval());
    loop {
        let inbound = tokio::select! {
            inbound = session.next(None) => inbound,
            _ = ticker.tick() => {
                if ctx.early_exit_requested() {
                    return Err(SchedulerError::EarlyExit);
                }
                continue;
            }
        };
        match inbound {
            None | Some(Inbound::Left(PeerId::COORDINATOR)) => {
                return Err(SchedulerError::LinkClosed(last));
            }
            Some(Inbound::Packet {
                packet:
                    Packet::Ready {
                        generation,
                        unit_count,
                    },
                ..
            }) if generations.is_newer(generation) => return Ok((generation, unit_count)),
            Some(Inbound::Packet { packet, .. }) => {
                trace!(kind = packet.kind(), generation = packet.generation().0, "ignoring packet before READY");
                *stale_dropped += 1;
            }
            Some(_) => {}
        }
    }
}

/// Serve one phase for the coordinator.
#[instrument(skip_all, fields(peer = %session.local_id()))]
pub(crate) async fn distribute_work_worker(
    session: &mut Session,
    config: &SchedulerConfig,
    telemetry: Arc<dyn TelemetrySink>,
    generations: &mut GenerationCounter,
    processor: Arc<dyn WorkProcessor>,
) -> Result<PhaseReport, SchedulerError> {
    if generations.exhausted() {
        return Err(SchedulerError::GenerationsExhausted {
            max: crate::phase::MAX_GENERATIONS,
        });
    }
    let ctx = Arc::clone(session.ctx());
    let mut stale_dropped = 0;
    let (generation, unit_count) = await_ready(session, generations, config, &mut stale_dropped).await?;
    generations.adopt(generation)?;

    let started = Instant::now();
    let (sent_before, received_before) = (ctx.bytes_sent(), ctx.bytes_received());
    let mut stats = StatsRecorder::new(generation, &ctx, telemetry);
    let mut report = PhaseReport::new(generation, Role::Executor, unit_count);
    report.stale_dropped = stale_dropped;
    info!(generation = generation.0, unit_count, "phase starting");

    let threads = config.resolved_worker_threads();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut pool = None;
    let mut source: Option<Arc<dyn WorkerSource>> = None;
    let finished = Arc::new(AtomicBool::new(false));

    let outcome = if unit_count == 0 {
        drop(events_tx);
        await_finished(session, config, generation, &mut report).await
    } else {
        let worker_source = config
            .policy
            .worker_source(unit_count, config, events_tx.clone());
        source = Some(Arc::clone(&worker_source));
        match session
            .send(PeerId::COORDINATOR, &Packet::WorkerReady { generation })
            .await
        {
            Ok(()) => {
                pool = Some(ExecutorPool::start(PoolSettings {
                    generation,
                    unit_count,
                    threads,
                    poll_interval: config.poll_interval(),
                    source: Arc::clone(&worker_source),
                    processor,
                    claims: Arc::new(ClaimTable::new(threads)),
                    finished: Arc::clone(&finished),
                    ctx: Arc::clone(&ctx),
                    events: events_tx,
                }));
                serve(
                    session,
                    config,
                    generation,
                    worker_source.as_ref(),
                    &mut events_rx,
                    &mut stats,
                    &mut report,
                )
                .await
            }
            Err(e) => {
                warn!(error = %e, "failed to announce readiness");
                Err(SchedulerError::LinkClosed(generation))
            }
        }
    };

    finished.store(true, Ordering::Release);
    if outcome.is_err() {
        ctx.request_early_exit();
    }
    let pool_result = match pool {
        Some(pool) => pool.join().await.map(|_| ()),
        None => Ok(()),
    };
    if let Some(source) = source {
        source.release();
    }
    // Results computed after FINISHED are no longer wanted.
    let mut discarded = 0;
    while let Ok(event) = events_rx.try_recv() {
        if matches!(event, ExecutorEvent::Completed { .. }) {
            discarded += 1;
        }
    }
    if discarded > 0 {
        debug!(discarded, "dropped results computed after FINISHED");
    }
    stats.sample(&ctx, report.completed);

    pool_result?;
    outcome?;

    report.elapsed = started.elapsed();
    report.bytes_sent = ctx.bytes_sent() - sent_before;
    report.bytes_received = ctx.bytes_received() - received_before;
    info!(
        generation = generation.0,
        elapsed_ms = report.elapsed.as_millis() as u64,
        shipped = report.completed,
        "phase finished"
    );
    Ok(report)
}

/// Forward pool output and inbound control traffic until FINISHED.
async fn serve(
    session: &mut Session,
    config: &SchedulerConfig,
    generation: Generation,
    source: &dyn WorkerSource,
    events: &mut mpsc::UnboundedReceiver<ExecutorEvent>,
    stats: &mut StatsRecorder,
    report: &mut PhaseReport,
) -> Result<(), SchedulerError> {
    let ctx = Arc::clone(session.ctx());
    let mut ticker = tokio::time::interval(config.stats_interval());
    loop {
        tokio::select! {
            inbound = session.next(Some(generation)) => match inbound {
                None | Some(Inbound::Left(PeerId::COORDINATOR)) => {
                    warn!(generation = generation.0, "lost the coordinator");
                    return Err(SchedulerError::LinkClosed(generation));
                }
                Some(Inbound::Packet { from, packet, stale }) => {
                    match packet {
                        Packet::Finished { generation: g } if g == generation => {
                            debug!(generation = g.0, "FINISHED received");
                            return Ok(());
                        }
                        // Sent again after the coordinator lost and re-admitted
                        // us under a new id; announce readiness for that id.
                        Packet::Ready { generation: g, .. } if g == generation => {
                            info!(generation = g.0, "READY repeated, announcing readiness again");
                            source.rejoined();
                            session
                                .send(PeerId::COORDINATOR, &Packet::WorkerReady { generation })
                                .await
                                .map_err(|_| SchedulerError::LinkClosed(generation))?;
                        }
                        Packet::Control { payload, .. } => {
                            if stale {
                                report.stale_dropped += 1;
                            }
                            if !source.handle_packet(&payload, from, stale) {
                                debug!(peer = %from, "control packet not handled");
                            }
                        }
                        other => {
                            trace!(kind = other.kind(), generation = other.generation().0, "ignoring packet");
                            if stale {
                                report.stale_dropped += 1;
                            }
                        }
                    }
                }
                Some(_) => {}
            },
            Some(event) = events.recv() => forward(session, generation, event, report).await?,
            _ = ticker.tick() => {
                if ctx.early_exit_requested() {
                    return Err(SchedulerError::EarlyExit);
                }
                stats.sample(&ctx, report.completed);
            }
        }
    }
}

async fn forward(
    session: &Session,
    generation: Generation,
    event: ExecutorEvent,
    report: &mut PhaseReport,
) -> Result<(), SchedulerError> {
    match event {
        ExecutorEvent::Started { unit } => {
            // Advisory only; losing it changes nothing.
            match session
                .send(PeerId::COORDINATOR, &Packet::Started { generation, unit })
                .await
            {
                Ok(()) => report.started_notices += 1,
                Err(e) => trace!(unit, error = %e, "STARTED not delivered"),
            }
        }
        ExecutorEvent::Completed { unit, payload } => {
            let packet = Packet::Results {
                generation,
                unit,
                payload,
            };
            session
                .send(PeerId::COORDINATOR, &packet)
                .await
                .map_err(|_| SchedulerError::LinkClosed(generation))?;
            report.completed += 1;
            report.local_completed += 1;
        }
        ExecutorEvent::Control(payload) => {
            session
                .send(PeerId::COORDINATOR, &Packet::Control { generation, payload })
                .await
                .map_err(|_| SchedulerError::LinkClosed(generation))?;
        }
        ExecutorEvent::Failed { reason } => {
            warn!(reason, "worker thread failed");
            return Err(SchedulerError::EarlyExit);
        }
    }
    Ok(())
}

/// An empty phase has nothing to compute; just wait for its FINISHED.
async fn await_finished(
    session: &mut Session,
    config: &SchedulerConfig,
    generation: Generation,
    report: &mut PhaseReport,
) -> Result<(), SchedulerError> {
    let ctx = Arc::clone(session.ctx());
    let mut ticker = tokio::time::interval(config.stats_interval());
    loop {
        let inbound = tokio::select! {
            inbound = session.next(Some(generation)) => inbound,
            _ = ticker.tick() => {
                if ctx.early_exit_requested() {
                    return Err(SchedulerError::EarlyExit);
                }
                continue;
            }
        };
        match inbound {
            None | Some(Inbound::Left(PeerId::COORDINATOR)) => {
                return Err(SchedulerError::LinkClosed(generation));
            }
            Some(Inbound::Packet {
                packet: Packet::Finished { generation: g },
                ..
            }) if g == generation => return Ok(()),
            Some(Inbound::Packet { stale: true, .. }) => report.stale_dropped += 1,
            Some(_) => {}
        }
    }
}
