//! Scheduler configuration.
//!
//! Parsed from `fanout.toml` with support for `FANOUT_SECTION_KEY`
//! environment variable overrides.

mod loading;
mod validation;

#[cfg(test)]
mod tests;

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fanout_transport::{LinkConfig, ProtocolId};

use crate::error::SchedulerError;

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for a fanout process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Phase scheduling behaviour.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Where the coordinator listens and how peer liveness is tracked.
    #[serde(default)]
    pub link: LinkConfig,
}

// ── Scheduler ───────────────────────────────────────────────────────

/// Which work-unit source drives a phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Coordinator pushes batches to executors and tops them up per result.
    #[default]
    RoundRobin,
    /// Executors ask for a batch whenever their local queue runs dry.
    OnDemand,
}

impl FromStr for SchedulingPolicy {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "on_demand" => Ok(Self::OnDemand),
            other => Err(SchedulerError::Config(format!(
                "unknown scheduling policy '{other}', expected 'round_robin' or 'on_demand'"
            ))),
        }
    }
}

/// Scheduler section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub policy: SchedulingPolicy,

    /// Worker threads per executor. 0 = available parallelism.
    #[serde(default)]
    pub worker_threads: usize,

    /// Worker threads the coordinator runs itself. 0 = dispatch only.
    #[serde(default)]
    pub local_threads: usize,

    /// Units handed out per assignment.
    #[serde(default = "default_units_per_assignment")]
    pub units_per_assignment: usize,

    /// Hand in-flight units to idle workers once nothing is pending.
    #[serde(default = "default_redistribute_tail")]
    pub redistribute_tail: bool,

    /// Back-off for worker threads that found nothing to do.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Interval between telemetry samples.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,

    /// Protocol id the scheduler registers on the link.
    #[serde(default = "default_protocol_id")]
    pub protocol_id: ProtocolId,
}

fn default_units_per_assignment() -> usize {
    4
}

fn default_redistribute_tail() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    10
}

fn default_stats_interval() -> u64 {
    1000
}

fn default_protocol_id() -> ProtocolId {
    0x44
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: SchedulingPolicy::default(),
            worker_threads: 0,
            local_threads: 0,
            units_per_assignment: default_units_per_assignment(),
            redistribute_tail: default_redistribute_tail(),
            poll_interval_ms: default_poll_interval(),
            stats_interval_ms: default_stats_interval(),
            protocol_id: default_protocol_id(),
        }
    }
}

impl SchedulerConfig {
    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}
