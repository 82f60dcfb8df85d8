//! Environment overrides for the cluster configuration.
//!
//! Tests mutate the process environment, so they run serially.

use std::time::Duration;

use raptor_cluster::cluster::{ClusterConfig, ClusterProfile};
use raptor_cluster::telemetry::{LogFormat, TelemetryConfig, init_logging};
use serial_test::serial;

const VARS: &[&str] = &[
    "RAPTOR_LOCK_TIMEOUT_SECS",
    "RAPTOR_WAIT_REPLY_TIMEOUT_SECS",
    "RAPTOR_WAIT_INFO_REPLY_TIMEOUT_SECS",
    "RAPTOR_ACK_TIMEOUT_SECS",
    "RAPTOR_MONITOR_INTERVAL_SECS",
    "RAPTOR_LINK_INIT_WAIT_SECS",
    "RAPTOR_LOCK_MAX_ATTEMPTS",
    "RAPTOR_HA_ENABLED",
    "RAPTOR_MASTER_BROKER",
    "RAPTOR_CLUSTER_PROFILE",
    "LOG_FORMAT",
    "OTEL_SERVICE_NAME",
];

fn clear_env() {
    for var in VARS {
        // SAFETY: tests in this file are #[serial], nothing else touches the environment.
        unsafe { std::env::remove_var(var) };
    }
}

fn set(var: &str, value: &str) {
    // SAFETY: see clear_env.
    unsafe { std::env::set_var(var, value) };
}

#[test]
#[serial]
fn test_from_env_defaults() {
    clear_env();
    let config = ClusterConfig::from_env();

    assert_eq!(config, ClusterConfig::from_profile(ClusterProfile::Production));
    assert_eq!(config.lock_timeout, Duration::from_secs(60));
    assert_eq!(config.wait_reply_timeout, Duration::from_secs(180));
    assert_eq!(config.ack_timeout, config.wait_reply_timeout);
    assert!(config.ha_enabled);
    assert_eq!(config.master_broker, None);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_from_env_overrides() {
    clear_env();
    set("RAPTOR_LOCK_TIMEOUT_SECS", "15");
    set("RAPTOR_WAIT_REPLY_TIMEOUT_SECS", "90");
    set("RAPTOR_LOCK_MAX_ATTEMPTS", "3");
    set("RAPTOR_HA_ENABLED", "false");
    set("RAPTOR_MASTER_BROKER", " broker-1 ");

    let config = ClusterConfig::from_env();
    clear_env();

    assert_eq!(config.lock_timeout, Duration::from_secs(15));
    assert_eq!(config.wait_reply_timeout, Duration::from_secs(90));
    assert_eq!(config.ack_timeout, Duration::from_secs(90));
    assert_eq!(config.lock_max_attempts, 3);
    assert!(!config.ha_enabled);
    assert_eq!(config.master_broker.as_deref(), Some("broker-1"));
}

#[test]
#[serial]
fn test_from_env_rejects_non_positive_values() {
    clear_env();
    set("RAPTOR_LOCK_TIMEOUT_SECS", "0");
    set("RAPTOR_WAIT_REPLY_TIMEOUT_SECS", "-5");
    set("RAPTOR_ACK_TIMEOUT_SECS", "soon");
    set("RAPTOR_LOCK_MAX_ATTEMPTS", "-1");
    set("RAPTOR_MASTER_BROKER", "   ");

    let config = ClusterConfig::from_env();
    clear_env();
    let defaults = ClusterConfig::from_profile(ClusterProfile::Production);

    assert_eq!(config.lock_timeout, defaults.lock_timeout);
    assert_eq!(config.wait_reply_timeout, defaults.wait_reply_timeout);
    assert_eq!(config.ack_timeout, defaults.wait_reply_timeout);
    assert_eq!(config.lock_max_attempts, defaults.lock_max_attempts);
    assert_eq!(config.master_broker, None);
}

#[test]
#[serial]
fn test_takeover_timeout_follows_monitor_interval() {
    clear_env();
    set("RAPTOR_MONITOR_INTERVAL_SECS", "45");
    let config = ClusterConfig::from_env();
    assert_eq!(config.takeover_pending_timeout, Duration::from_secs(90));

    set("RAPTOR_MONITOR_INTERVAL_SECS", "5");
    let config = ClusterConfig::from_env();
    clear_env();
    assert_eq!(config.monitor_interval, Duration::from_secs(5));
    assert_eq!(config.takeover_pending_timeout, Duration::from_secs(60));
}

#[test]
#[serial]
fn test_profile_from_env() {
    clear_env();
    set("RAPTOR_CLUSTER_PROFILE", "testing");
    let config = ClusterConfig::from_profile_env();
    assert_eq!(config, ClusterConfig::from_profile(ClusterProfile::Testing));

    set("RAPTOR_CLUSTER_PROFILE", "nonsense");
    let config = ClusterConfig::from_profile_env();
    clear_env();
    assert_eq!(config, ClusterConfig::from_profile(ClusterProfile::Production));
}

#[test]
fn test_every_profile_validates() {
    for profile in ClusterProfile::all() {
        assert!(
            ClusterConfig::from_profile(*profile).validate().is_ok(),
            "{profile} profile invalid"
        );
    }
}

#[test]
#[serial]
fn test_logging_setup_from_env() {
    clear_env();
    assert_eq!(LogFormat::from_env(), LogFormat::Pretty);

    set("LOG_FORMAT", "json");
    set("OTEL_SERVICE_NAME", "broker-7");
    let telemetry = TelemetryConfig::from_env();
    clear_env();
    assert_eq!(telemetry.log_format, LogFormat::Json);
    assert_eq!(telemetry.service_name, "broker-7");

    init_logging(telemetry.log_format).unwrap();
    // Only one global subscriber per process.
    assert!(init_logging(LogFormat::Pretty).is_err());
}
