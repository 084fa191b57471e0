use std::sync::Arc;

use tracing::info;

use fanout_transport::{Link, PeerId};

use crate::config::SchedulerConfig;
use crate::context::DistributionContext;
use crate::coordinator::distribute_work_master;
use crate::dispatch::Session;
use crate::error::SchedulerError;
use crate::executor::distribute_work_worker;
use crate::phase::{Generation, GenerationCounter, PhaseReport, Role, WorkUnitIndex};
use crate::telemetry::{TelemetrySink, TracingSink};
use crate::work::{WorkProcessor, WorkReceiver};

/// Entry point for running phases over one long-lived link.
///
/// Build one per process with [`Distributor::coordinator`] or
/// [`Distributor::executor`] and call [`Distributor::distribute_work`] once
/// per phase. Phases never overlap: each call takes `&mut self`.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use fanout_scheduler::{Distributor, DistributionContext, ProcessError, SchedulerConfig};
/// # use fanout_transport::{MemoryHub, PeerId};
/// # async fn run() -> Result<(), fanout_scheduler::SchedulerError> {
/// let hub = MemoryHub::new();
/// let config = SchedulerConfig { local_threads: 2, ..SchedulerConfig::default() };
/// let mut coordinator = Distributor::coordinator(
///     Arc::new(hub.coordinator()),
///     config,
///     Arc::new(DistributionContext::new()),
/// );
/// let square = |_thread: usize, unit: u64, out: &mut Vec<u8>| -> Result<(), ProcessError> {
///     out.extend_from_slice(&(unit * unit).to_le_bytes());
///     Ok(())
/// };
/// let mut total = 0u64;
/// let mut merge = |_unit: u64, payload: &[u8], _from: PeerId| {
///     total += u64::from_le_bytes(payload.try_into().unwrap());
/// };
/// let report = coordinator.distribute_work(100, Arc::new(square), &mut merge).await?;
/// println!("{} units in {:.2}s", report.completed, report.elapsed_seconds());
/// # Ok(())
/// # }
/// ```
pub struct Distributor {
    role: Role,
    session: Session,
    config: SchedulerConfig,
    generations: GenerationCounter,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Distributor {
    /// Distributor for the single coordinating process.
    pub fn coordinator(
        link: Arc<dyn Link>,
        config: SchedulerConfig,
        ctx: Arc<DistributionContext>,
    ) -> Self {
        Self::new(Role::Coordinator, link, config, ctx)
    }

    /// Distributor for an executor process.
    pub fn executor(
        link: Arc<dyn Link>,
        config: SchedulerConfig,
        ctx: Arc<DistributionContext>,
    ) -> Self {
        Self::new(Role::Executor, link, config, ctx)
    }

    fn new(
        role: Role,
        link: Arc<dyn Link>,
        config: SchedulerConfig,
        ctx: Arc<DistributionContext>,
    ) -> Self {
        let session = Session::open(link, config.protocol_id, ctx);
        Self {
            role,
            session,
            config,
            generations: GenerationCounter::default(),
            telemetry: Arc::new(TracingSink),
        }
    }

    /// Send stats samples somewhere other than the log.
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_id(&self) -> PeerId {
        self.session.local_id()
    }

    pub fn context(&self) -> &Arc<DistributionContext> {
        self.session.ctx()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The generation of the most recent phase.
    pub fn last_generation(&self) -> Option<Generation> {
        self.generations.last()
    }

    /// Run one phase of `unit_count` units.
    ///
    /// Fails with [`SchedulerError::Config`] before anything is sent if the
    /// scheduler settings are invalid.
    ///
    /// On the coordinator this returns once every unit has been accepted and
    /// passed to `receiver`. On an executor it returns once the coordinator
    /// announces the phase finished; `processor` computes the units and
    /// `receiver` is not used.
    pub async fn distribute_work(
        &mut self,
        unit_count: WorkUnitIndex,
        processor: Arc<dyn WorkProcessor>,
        receiver: &mut dyn WorkReceiver,
    ) -> Result<PhaseReport, SchedulerError> {
        self.config.validate()?;
        if self.session.ctx().early_exit_requested() {
            return Err(SchedulerError::EarlyExit);
        }
        let report = match self.role {
            Role::Coordinator => {
                let generation = self.generations.next()?;
                distribute_work_master(
                    &mut self.session,
                    &self.config,
                    Arc::clone(&self.telemetry),
                    generation,
                    unit_count,
                    processor,
                    receiver,
                )
                .await?
            }
            Role::Executor => {
                distribute_work_worker(
                    &mut self.session,
                    &self.config,
                    Arc::clone(&self.telemetry),
                    &mut self.generations,
                    processor,
                )
                .await?
            }
        };
        info!(
            generation = report.generation.0,
            role = ?report.role,
            elapsed_s = report.elapsed_seconds(),
            duplicates = report.duplicates,
            "distribute_work returned"
        );
        Ok(report)
    }
}
