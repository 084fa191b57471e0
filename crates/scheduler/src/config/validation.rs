use crate::error::SchedulerError;

use super::{FanoutConfig, SchedulerConfig};

impl FanoutConfig {
    /// Validate both sections.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        self.scheduler.validate()?;
        self.link
            .validate()
            .map_err(|e| SchedulerError::Config(format!("link: {e}")))?;
        Ok(())
    }
}

impl SchedulerConfig {
    /// Reject settings that would stall a phase.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.units_per_assignment == 0 {
            return Err(SchedulerError::Config(
                "scheduler.units_per_assignment must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(SchedulerError::Config(
                "scheduler.poll_interval_ms must be positive".into(),
            ));
        }
        if self.stats_interval_ms == 0 {
            return Err(SchedulerError::Config(
                "scheduler.stats_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
