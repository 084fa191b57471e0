use thiserror::Error;

use fanout_transport::TransportError;

use crate::phase::{Generation, WorkUnitIndex};

/// Errors that can occur while distributing work.
///
/// Duplicate results, executor disconnects and an empty pending pool are
/// handled inside a phase and never show up here. Everything below ends the
/// phase after the local thread pool has been joined.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("generation limit reached: at most {max} phases per process")]
    GenerationsExhausted { max: u32 },

    #[error("thread {thread} tried to claim unit {unit} while it is already in flight")]
    DoubleClaim { thread: usize, unit: WorkUnitIndex },

    #[error("work unit {unit} failed: {reason}")]
    Process { unit: WorkUnitIndex, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("link to the coordinator closed during {0}")]
    LinkClosed(Generation),

    #[error("an earlier fatal error requested early exit")]
    EarlyExit,

    #[error("thread pool error: {0}")]
    ThreadPool(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("work unit {unit} outside 0..{unit_count}")]
    UnitOutOfRange {
        unit: WorkUnitIndex,
        unit_count: u64,
    },
}
