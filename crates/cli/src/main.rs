//! fanout: run a coordinator or an executor of the demo prime workload.
//!
//! # Usage
//!
//! ```bash
//! # Coordinator computing with 4 threads of its own, 3 phases of 500 units
//! fanout --threads 4 coordinator --units 500 --phases 3
//!
//! # Executors, each on its own machine
//! fanout --endpoint tcp://10.0.0.1:5900 executor
//!
//! # Via environment variables
//! FANOUT_LINK_ENDPOINT=ipc://fanout FANOUT_SCHEDULER_POLICY=on_demand fanout executor
//! ```

mod cli;
mod workload;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use fanout_scheduler::{
    DiscardResults, DistributionContext, Distributor, FanoutConfig, SchedulerError,
};
use fanout_transport::{ZmqCoordinatorLink, ZmqExecutorLink};

use crate::cli::{CliArgs, Command, CoordinatorArgs};
use crate::workload::{PrimeBlocks, PrimeTotal, BLOCK};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real environment variables win.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    info!(?config, "starting fanout");

    match args.command {
        Command::Coordinator(run) => coordinator(config, run).await,
        Command::Executor => executor(config).await,
    }
}

fn load_config(args: &CliArgs) -> Result<FanoutConfig> {
    let mut config = match &args.config {
        Some(path) => FanoutConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => FanoutConfig::from_env().context("invalid FANOUT_* environment")?,
    };
    if let Some(endpoint) = &args.endpoint {
        config.link.endpoint = endpoint.clone();
    }
    if let Some(threads) = args.threads {
        config.scheduler.worker_threads = threads;
        if matches!(args.command, Command::Coordinator(_)) {
            config.scheduler.local_threads = threads;
        }
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn coordinator(config: FanoutConfig, run: CoordinatorArgs) -> Result<()> {
    let link = ZmqCoordinatorLink::bind(&config.link)
        .await
        .context("failed to bind coordinator link")?;
    let ctx = Arc::new(DistributionContext::new());
    let mut distributor =
        Distributor::coordinator(Arc::new(link), config.scheduler, Arc::clone(&ctx));

    info!(settle_ms = run.settle_ms, "waiting for executors");
    tokio::time::sleep(Duration::from_millis(run.settle_ms)).await;

    let processor = Arc::new(PrimeBlocks);
    for phase in 1..=run.phases {
        let mut total = PrimeTotal::default();
        let report = {
            let running = distributor.distribute_work(run.units, processor.clone(), &mut total);
            tokio::pin!(running);
            tokio::select! {
                report = &mut running => report?,
                _ = shutdown_signal() => {
                    info!(phase, "shutdown signal received, stopping phase");
                    ctx.request_early_exit();
                    if let Err(e) = running.await {
                        info!(error = %e, "phase stopped");
                    }
                    return Ok(());
                }
            }
        };

        if total.malformed > 0 {
            warn!(malformed = total.malformed, "some results could not be decoded");
        }
        info!(
            phase,
            generation = report.generation.0,
            primes = total.primes,
            below = run.units * BLOCK,
            elapsed_s = report.elapsed_seconds(),
            "phase complete"
        );
        if run.json {
            println!("{}", serde_json::to_string(&report)?);
        }
    }

    info!("fanout coordinator exited cleanly");
    Ok(())
}

async fn executor(config: FanoutConfig) -> Result<()> {
    let link = Arc::new(
        ZmqExecutorLink::connect(&config.link)
            .await
            .context("failed to reach the coordinator")?,
    );
    let ctx = Arc::new(DistributionContext::new());
    let mut distributor = Distributor::executor(link.clone(), config.scheduler, Arc::clone(&ctx));
    let processor = Arc::new(PrimeBlocks);

    let served = async {
        loop {
            match distributor
                .distribute_work(0, processor.clone(), &mut DiscardResults)
                .await
            {
                Ok(report) => info!(
                    generation = report.generation.0,
                    shipped = report.completed,
                    "phase served"
                ),
                Err(SchedulerError::LinkClosed(last)) => {
                    info!(%last, "coordinator gone");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    };

    tokio::pin!(served);
    tokio::select! {
        result = &mut served => result?,
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining");
            ctx.request_early_exit();
            match served.await {
                Ok(()) | Err(SchedulerError::EarlyExit) => {}
                Err(e) => warn!(error = %e, "executor stopped with an error"),
            }
        }
    }
    link.close().await;
    info!("fanout executor exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
