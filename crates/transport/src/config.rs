use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::TransportError;

/// Link section: where the coordinator listens and how liveness is tracked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    /// Endpoint the coordinator binds and executors connect to.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Interval between heartbeats in both directions.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// A peer silent for this long is reported as disconnected.
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_ms: u64,
}

fn default_endpoint() -> String {
    "tcp://127.0.0.1:5900".into()
}

fn default_heartbeat_interval() -> u64 {
    500
}

fn default_peer_timeout() -> u64 {
    3000
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            peer_timeout_ms: default_peer_timeout(),
        }
    }
}

impl LinkConfig {
    /// Resolve the configured endpoint string.
    pub fn endpoint(&self) -> Result<Endpoint, TransportError> {
        Endpoint::parse(&self.endpoint)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    /// Check that the endpoint parses and the timeout outlasts a heartbeat.
    pub fn validate(&self) -> Result<(), TransportError> {
        self.endpoint()?;
        if self.heartbeat_interval_ms == 0 {
            return Err(TransportError::Transport(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.peer_timeout_ms <= self.heartbeat_interval_ms {
            return Err(TransportError::Transport(format!(
                "peer_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.peer_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = LinkConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.endpoint().unwrap(), Endpoint::tcp("127.0.0.1", 5900));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(500));
    }

    #[test]
    fn timeout_must_exceed_heartbeat() {
        let cfg = LinkConfig {
            heartbeat_interval_ms: 1000,
            peer_timeout_ms: 1000,
            ..LinkConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
