use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Fan independent work units out to a pool of executor processes.
#[derive(Parser, Debug)]
#[command(name = "fanout", version, about)]
pub struct CliArgs {
    /// Path to a fanout.toml; defaults plus FANOUT_* overrides when unset.
    #[arg(long, env = "FANOUT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Override the link endpoint, e.g. tcp://0.0.0.0:5900 or ipc://fanout.
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Worker threads in this process (0 = available parallelism).
    #[arg(long, global = true)]
    pub threads: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bind the link and drive phases of the demo workload.
    Coordinator(CoordinatorArgs),
    /// Join a coordinator and serve phases until it goes away.
    Executor,
}

#[derive(Args, Debug)]
pub struct CoordinatorArgs {
    /// Work units per phase.
    #[arg(long, default_value_t = 1000)]
    pub units: u64,

    /// Number of consecutive phases to run.
    #[arg(long, default_value_t = 1)]
    pub phases: u32,

    /// How long to wait for executors before the first phase.
    #[arg(long, default_value_t = 1000)]
    pub settle_ms: u64,

    /// Print each phase report as a JSON line on stdout.
    #[arg(long)]
    pub json: bool,
}
