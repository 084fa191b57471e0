use std::collections::HashMap;

use super::{FanoutConfig, SchedulerConfig, SchedulingPolicy};
use crate::error::SchedulerError;

#[test]
fn empty_toml_gives_defaults() {
    let cfg = FanoutConfig::from_toml("").unwrap();
    assert_eq!(cfg.scheduler.policy, SchedulingPolicy::RoundRobin);
    assert_eq!(cfg.scheduler.units_per_assignment, 4);
    assert!(cfg.scheduler.redistribute_tail);
    assert_eq!(cfg.scheduler.protocol_id, 0x44);
    assert_eq!(cfg.link.peer_timeout_ms, 3000);
}

#[test]
fn parse_full_toml() {
    let toml = r#"
[scheduler]
policy = "on_demand"
worker_threads = 8
local_threads = 2
units_per_assignment = 16
redistribute_tail = false
poll_interval_ms = 5
stats_interval_ms = 250
protocol_id = 7

[link]
endpoint = "tcp://10.0.0.1:6000"
heartbeat_interval_ms = 200
peer_timeout_ms = 1000
"#;
    let cfg = FanoutConfig::from_toml(toml).unwrap();
    assert_eq!(cfg.scheduler.policy, SchedulingPolicy::OnDemand);
    assert_eq!(cfg.scheduler.resolved_worker_threads(), 8);
    assert_eq!(cfg.scheduler.local_threads, 2);
    assert_eq!(cfg.scheduler.units_per_assignment, 16);
    assert!(!cfg.scheduler.redistribute_tail);
    assert_eq!(cfg.scheduler.poll_interval().as_millis(), 5);
    assert_eq!(cfg.scheduler.protocol_id, 7);
    assert_eq!(cfg.link.endpoint, "tcp://10.0.0.1:6000");
}

#[test]
fn unknown_policy_is_a_parse_error() {
    let toml = r#"
[scheduler]
policy = "random"
"#;
    assert!(matches!(
        FanoutConfig::from_toml(toml),
        Err(SchedulerError::ConfigParse(_))
    ));
}

#[test]
fn overrides_replace_file_values() {
    let mut cfg = FanoutConfig::default();
    let env: HashMap<&str, &str> = [
        ("FANOUT_SCHEDULER_POLICY", "on_demand"),
        ("FANOUT_SCHEDULER_LOCAL_THREADS", "3"),
        ("FANOUT_SCHEDULER_REDISTRIBUTE_TAIL", "false"),
        ("FANOUT_SCHEDULER_WORKER_THREADS", "not-a-number"),
        ("FANOUT_LINK_ENDPOINT", "ipc:///tmp/fanout/test.sock"),
        ("FANOUT_LINK_PEER_TIMEOUT_MS", "9000"),
    ]
    .into_iter()
    .collect();
    cfg.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

    assert_eq!(cfg.scheduler.policy, SchedulingPolicy::OnDemand);
    assert_eq!(cfg.scheduler.local_threads, 3);
    assert!(!cfg.scheduler.redistribute_tail);
    // Unparseable values leave the previous setting alone.
    assert_eq!(cfg.scheduler.worker_threads, 0);
    assert_eq!(cfg.link.endpoint, "ipc:///tmp/fanout/test.sock");
    assert_eq!(cfg.link.peer_timeout_ms, 9000);
    assert!(cfg.validate().is_ok());
}

#[test]
fn zero_batch_is_rejected() {
    let cfg = SchedulerConfig {
        units_per_assignment: 0,
        ..SchedulerConfig::default()
    };
    assert!(matches!(cfg.validate(), Err(SchedulerError::Config(_))));
}

#[test]
fn bad_link_section_is_rejected() {
    let toml = r#"
[link]
heartbeat_interval_ms = 500
peer_timeout_ms = 100
"#;
    assert!(matches!(
        FanoutConfig::from_toml(toml),
        Err(SchedulerError::Config(_))
    ));
}

#[test]
fn policy_from_str() {
    assert_eq!("round_robin".parse::<SchedulingPolicy>().unwrap(), SchedulingPolicy::RoundRobin);
    assert!("fifo".parse::<SchedulingPolicy>().is_err());
}
