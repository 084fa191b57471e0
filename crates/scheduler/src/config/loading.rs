use std::path::Path;

use crate::error::SchedulerError;

use super::FanoutConfig;

impl FanoutConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, SchedulerError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides, for runs without a config file.
    pub fn from_env() -> Result<Self, SchedulerError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `FANOUT_SECTION_KEY` overrides `section.key`.
    /// Examples:
    /// - `FANOUT_SCHEDULER_POLICY` -> `scheduler.policy`
    /// - `FANOUT_SCHEDULER_WORKER_THREADS` -> `scheduler.worker_threads`
    /// - `FANOUT_LINK_ENDPOINT` -> `link.endpoint`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored.
    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let s = &mut self.scheduler;
        if let Some(v) = lookup("FANOUT_SCHEDULER_POLICY") {
            if let Ok(policy) = v.parse() {
                s.policy = policy;
            }
        }
        if let Some(v) = lookup("FANOUT_SCHEDULER_WORKER_THREADS") {
            if let Ok(n) = v.parse() {
                s.worker_threads = n;
            }
        }
        if let Some(v) = lookup("FANOUT_SCHEDULER_LOCAL_THREADS") {
            if let Ok(n) = v.parse() {
                s.local_threads = n;
            }
        }
        if let Some(v) = lookup("FANOUT_SCHEDULER_UNITS_PER_ASSIGNMENT") {
            if let Ok(n) = v.parse() {
                s.units_per_assignment = n;
            }
        }
        if let Some(v) = lookup("FANOUT_SCHEDULER_REDISTRIBUTE_TAIL") {
            if let Ok(b) = v.parse() {
                s.redistribute_tail = b;
            }
        }
        if let Some(v) = lookup("FANOUT_SCHEDULER_POLL_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                s.poll_interval_ms = ms;
            }
        }
        if let Some(v) = lookup("FANOUT_SCHEDULER_STATS_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                s.stats_interval_ms = ms;
            }
        }
        if let Some(v) = lookup("FANOUT_SCHEDULER_PROTOCOL_ID") {
            if let Ok(id) = v.parse() {
                s.protocol_id = id;
            }
        }

        let l = &mut self.link;
        if let Some(v) = lookup("FANOUT_LINK_ENDPOINT") {
            l.endpoint = v;
        }
        if let Some(v) = lookup("FANOUT_LINK_HEARTBEAT_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                l.heartbeat_interval_ms = ms;
            }
        }
        if let Some(v) = lookup("FANOUT_LINK_PEER_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                l.peer_timeout_ms = ms;
            }
        }
    }
}
