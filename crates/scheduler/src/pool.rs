//! Worker thread pool that pulls units from a [`WorkerSource`] and computes
//! them.
//!
//! Each thread loops: check for finish or early exit, ask the source for a
//! unit, claim it, announce it, compute it, then hand the payload to the
//! owning task through an unbounded channel. No thread ever waits for an
//! acknowledgement.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::DistributionContext;
use crate::error::SchedulerError;
use crate::phase::{ClaimTable, Generation, WorkUnitIndex};
use crate::source::WorkerSource;
use crate::work::WorkProcessor;

/// What a worker thread reports to the task that owns the phase.
#[derive(Debug)]
pub enum ExecutorEvent {
    /// A thread claimed `unit` and is about to compute it.
    Started { unit: WorkUnitIndex },
    /// A thread finished `unit`.
    Completed {
        unit: WorkUnitIndex,
        payload: Vec<u8>,
    },
    /// Policy traffic produced by the worker source.
    Control(Vec<u8>),
    /// A thread hit a fatal error and requested early exit.
    Failed { reason: String },
}

/// Everything a worker thread needs, shared by all threads of one pool.
pub struct PoolSettings {
    pub generation: Generation,
    pub unit_count: u64,
    pub threads: usize,
    pub poll_interval: Duration,
    pub source: Arc<dyn WorkerSource>,
    pub processor: Arc<dyn WorkProcessor>,
    pub claims: Arc<ClaimTable>,
    pub finished: Arc<AtomicBool>,
    pub ctx: Arc<DistributionContext>,
    pub events: mpsc::UnboundedSender<ExecutorEvent>,
}

/// A running pool. Call [`ExecutorPool::join`] before tearing anything down.
///
/// Dropping a pool that was never joined (an abandoned phase future) sets
/// its finished flag and requests early exit, so the threads drain instead
/// of polling forever and holding up runtime shutdown.
pub struct ExecutorPool {
    handle: Option<JoinHandle<Result<u64, SchedulerError>>>,
    finished: Arc<AtomicBool>,
    ctx: Arc<DistributionContext>,
}

impl ExecutorPool {
    /// Start `settings.threads` worker threads on a dedicated rayon pool.
    pub fn start(settings: PoolSettings) -> Self {
        let finished = Arc::clone(&settings.finished);
        let ctx = Arc::clone(&settings.ctx);
        let handle = tokio::task::spawn_blocking(move || Self::run(settings));
        Self {
            handle: Some(handle),
            finished,
            ctx,
        }
    }

    /// Wait for every thread to exit. Returns the number of units computed,
    /// or the first fatal error any thread hit.
    pub async fn join(mut self) -> Result<u64, SchedulerError> {
        let Some(handle) = self.handle.take() else {
            return Ok(0);
        };
        handle
            .await
            .map_err(|e| SchedulerError::ThreadPool(format!("pool task failed: {e}")))?
    }

    fn run(settings: PoolSettings) -> Result<u64, SchedulerError> {
        let threads = settings.threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("fanout-worker-{i}"))
            .build()
            .map_err(|e| SchedulerError::ThreadPool(e.to_string()))?;

        info!(
            generation = settings.generation.0,
            threads,
            "worker pool starting"
        );

        let computed = AtomicU64::new(0);
        let first_error: Mutex<Option<SchedulerError>> = Mutex::new(None);

        pool.scope(|scope| {
            for thread in 0..threads {
                let settings = &settings;
                let computed = &computed;
                let first_error = &first_error;
                scope.spawn(move |_| {
                    if let Err(e) = worker_loop(thread, settings, computed) {
                        settings.ctx.request_early_exit();
                        error!(thread, error = %e, "worker thread failed");
                        let _ = settings.events.send(ExecutorEvent::Failed {
                            reason: e.to_string(),
                        });
                        let mut slot = first_error.lock().unwrap_or_else(|p| p.into_inner());
                        slot.get_or_insert(e);
                    }
                });
            }
        });

        let computed = computed.load(Ordering::Relaxed);
        info!(
            generation = settings.generation.0,
            computed,
            "worker pool drained"
        );
        match first_error.into_inner().unwrap_or_else(|p| p.into_inner()) {
            Some(e) => Err(e),
            None => Ok(computed),
        }
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!("worker pool dropped without join, stopping its threads");
            self.finished.store(true, Ordering::Release);
            self.ctx.request_early_exit();
        }
    }
}

fn worker_loop(
    thread: usize,
    settings: &PoolSettings,
    computed: &AtomicU64,
) -> Result<(), SchedulerError> {
    loop {
        // Idle
        if settings.ctx.early_exit_requested()
            || settings.finished.load(Ordering::Acquire)
            || settings.events.is_closed()
        {
            debug!(thread, "worker thread draining");
            return Ok(());
        }

        // Claiming
        let Some(unit) = settings.source.get_next_work_unit(thread, &settings.claims)? else {
            std::thread::sleep(settings.poll_interval);
            continue;
        };
        if unit >= settings.unit_count {
            settings.claims.release(thread);
            return Err(SchedulerError::UnitOutOfRange {
                unit,
                unit_count: settings.unit_count,
            });
        }
        let _ = settings.events.send(ExecutorEvent::Started { unit });

        // Computing
        let mut payload = Vec::new();
        let result = settings.processor.process(thread, unit, &mut payload);
        if let Err(e) = result {
            settings.claims.release(thread);
            return Err(SchedulerError::Process {
                unit,
                reason: e.to_string(),
            });
        }

        // Reporting
        settings.source.note_local_work_unit_completed(unit);
        settings.claims.release(thread);
        computed.fetch_add(1, Ordering::Relaxed);
        if settings
            .events
            .send(ExecutorEvent::Completed { unit, payload })
            .is_err()
        {
            debug!(thread, "phase owner gone, worker thread stopping");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{PolicyMessage, QueueWorkerSource};
    use crate::work::ProcessError;
    use fanout_transport::PeerId;

    fn settings(
        unit_count: u64,
        threads: usize,
        processor: Arc<dyn WorkProcessor>,
    ) -> (PoolSettings, Arc<QueueWorkerSource>, mpsc::UnboundedReceiver<ExecutorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Arc::new(QueueWorkerSource::push(unit_count, tx.clone()));
        let assign = PolicyMessage::Assign {
            units: (0..unit_count).collect(),
        };
        source.handle_packet(&assign.encode().unwrap(), PeerId::COORDINATOR, false);
        let settings = PoolSettings {
            generation: Generation(1),
            unit_count,
            threads,
            poll_interval: Duration::from_millis(1),
            source: source.clone(),
            processor,
            claims: Arc::new(ClaimTable::new(threads)),
            finished: Arc::new(AtomicBool::new(false)),
            ctx: Arc::new(DistributionContext::new()),
            events: tx,
        };
        (settings, source, rx)
    }

    #[tokio::test]
    async fn computes_every_assigned_unit() {
        let processor = |_thread: usize, unit: u64, out: &mut Vec<u8>| -> Result<(), ProcessError> {
            out.extend_from_slice(&unit.to_le_bytes());
            Ok(())
        };
        let (settings, _source, mut rx) = settings(20, 3, Arc::new(processor));
        let finished = settings.finished.clone();
        let pool = ExecutorPool::start(settings);

        let mut completed = Vec::new();
        let mut started = 0;
        while completed.len() < 20 {
            match rx.recv().await.unwrap() {
                ExecutorEvent::Started { .. } => started += 1,
                ExecutorEvent::Completed { unit, payload } => {
                    assert_eq!(payload, unit.to_le_bytes().to_vec());
                    completed.push(unit);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        finished.store(true, Ordering::Release);
        assert_eq!(pool.join().await.unwrap(), 20);

        completed.sort_unstable();
        assert_eq!(completed, (0..20).collect::<Vec<_>>());
        assert_eq!(started, 20);
    }

    #[tokio::test]
    async fn failure_sets_early_exit_and_surfaces_on_join() {
        let processor = |_thread: usize, unit: u64, _out: &mut Vec<u8>| -> Result<(), ProcessError> {
            if unit == 2 {
                Err("boom".into())
            } else {
                Ok(())
            }
        };
        let (settings, _source, mut rx) = settings(5, 1, Arc::new(processor));
        let ctx = settings.ctx.clone();
        let pool = ExecutorPool::start(settings);

        let err = pool.join().await.unwrap_err();
        assert!(matches!(err, SchedulerError::Process { unit: 2, .. }));
        assert!(ctx.early_exit_requested());

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let ExecutorEvent::Failed { reason } = event {
                assert!(reason.contains("boom"));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn dropping_an_unjoined_pool_stops_its_threads() {
        let processor = |_thread: usize, _unit: u64, _out: &mut Vec<u8>| -> Result<(), ProcessError> { Ok(()) };
        let (settings, _source, _rx) = settings(0, 2, Arc::new(processor));
        let finished = settings.finished.clone();
        let ctx = settings.ctx.clone();
        drop(ExecutorPool::start(settings));
        assert!(finished.load(Ordering::Acquire));
        assert!(ctx.early_exit_requested());
    }

    #[tokio::test]
    async fn idle_threads_stop_once_the_owner_is_gone() {
        let processor = |_thread: usize, _unit: u64, _out: &mut Vec<u8>| -> Result<(), ProcessError> { Ok(()) };
        let (settings, _source, rx) = settings(0, 2, Arc::new(processor));
        drop(rx);
        let pool = ExecutorPool::start(settings);
        let joined = tokio::time::timeout(Duration::from_secs(5), pool.join()).await;
        assert_eq!(joined.expect("pool kept running").unwrap(), 0);
    }

    #[tokio::test]
    async fn finished_flag_stops_idle_threads() {
        let processor = |_thread: usize, _unit: u64, _out: &mut Vec<u8>| -> Result<(), ProcessError> { Ok(()) };
        let (settings, _source, _rx) = settings(0, 2, Arc::new(processor));
        let finished = settings.finished.clone();
        let pool = ExecutorPool::start(settings);
        tokio::time::sleep(Duration::from_millis(20)).await;
        finished.store(true, Ordering::Release);
        assert_eq!(pool.join().await.unwrap(), 0);
    }
}
