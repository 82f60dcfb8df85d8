//! Configuration for the cluster coordination layer.
//!
//! # Configuration Profiles
//!
//! ```rust,no_run
//! use raptor_cluster::cluster::{ClusterConfig, ClusterProfile};
//!
//! // Production profile - built-in timeout defaults
//! let prod_config = ClusterConfig::from_profile(ClusterProfile::Production);
//!
//! // Testing profile - millisecond timeouts for in-process clusters
//! let test_config = ClusterConfig::from_profile(ClusterProfile::Testing);
//! ```
//!
//! Timeouts that are unset or non-positive in the environment fall back to
//! their defaults in [`crate::constants`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    CURRENT_PROTOCOL_VERSION, DEFAULT_ACK_TIMEOUT_SECS, DEFAULT_LINK_DEACTIVATE_POLL_SECS,
    DEFAULT_LINK_INIT_WAIT_SECS, DEFAULT_LOCK_BACKOFF_UNIT_MS, DEFAULT_LOCK_TIMEOUT_SECS,
    DEFAULT_MONITOR_INTERVAL_SECS, DEFAULT_TAKEOVER_PENDING_TIMEOUT_SECS,
    DEFAULT_WAIT_INFO_REPLY_TIMEOUT_SECS, DEFAULT_WAIT_REPLY_TIMEOUT_SECS, LOCK_MAX_ATTEMPTS,
    MAX_WAIT_REPLY_INTERVAL_SECS, MIN_PROTOCOL_VERSION,
};

/// Validated configuration profiles.
///
/// | Profile | Use Case | Timeouts |
/// |---------|----------|----------|
/// | Development | Local multi-broker testing | Short (seconds) |
/// | Production | Deployed clusters | Built-in defaults |
/// | Testing | In-process test clusters | Milliseconds |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterProfile {
    /// Short timeouts so a stuck protocol surfaces quickly while debugging.
    Development,

    /// Built-in defaults. This is the recommended profile for deployments.
    Production,

    /// Millisecond-scale timeouts for in-process clusters.
    ///
    /// **Not suitable for real networks.**
    Testing,
}

impl ClusterProfile {
    pub fn description(&self) -> &'static str {
        match self {
            ClusterProfile::Development => "Local multi-broker development",
            ClusterProfile::Production => "Deployed clusters",
            ClusterProfile::Testing => "In-process test clusters",
        }
    }

    pub fn all() -> &'static [ClusterProfile] {
        &[
            ClusterProfile::Development,
            ClusterProfile::Production,
            ClusterProfile::Testing,
        ]
    }
}

impl std::fmt::Display for ClusterProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterProfile::Development => write!(f, "development"),
            ClusterProfile::Production => write!(f, "production"),
            ClusterProfile::Testing => write!(f, "testing"),
        }
    }
}

impl std::str::FromStr for ClusterProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(ClusterProfile::Development),
            "production" | "prod" => Ok(ClusterProfile::Production),
            "testing" | "test" => Ok(ClusterProfile::Testing),
            _ => Err(format!(
                "Unknown profile '{}'. Valid profiles: development, production, testing",
                s
            )),
        }
    }
}

/// Timeouts and identity settings for one broker's coordination layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Time to collect every vote of one election round.
    pub lock_timeout: Duration,
    /// Time to wait for a reply to a cluster request.
    pub wait_reply_timeout: Duration,
    /// Time to wait for INFO replies during store session lookups.
    pub wait_info_reply_timeout: Duration,
    /// Time to wait for a message acknowledgement reply.
    pub ack_timeout: Duration,
    /// Time to wait for the takeover pending convergecast, and the grant
    /// a taker has to finish a takeover.
    pub takeover_pending_timeout: Duration,
    /// HA monitor interval.
    pub monitor_interval: Duration,
    /// Maximum time to wait for a force-closed link to deactivate.
    pub link_init_wait: Duration,
    /// Poll interval while waiting for a link to deactivate.
    pub link_deactivate_poll_interval: Duration,
    /// Upper bound on a single condition wait.
    pub max_reply_wait_interval: Duration,
    /// Election attempts before a contended lock fails.
    pub lock_max_attempts: u32,
    /// Unit of the random exponential backoff between election attempts.
    pub lock_backoff_unit: Duration,
    /// Whether this broker runs in HA mode.
    pub ha_enabled: bool,
    /// Broker id of the configured config server (master broker), if any.
    pub master_broker: Option<String>,
    /// Cluster protocol version spoken by this broker.
    pub protocol_version: u32,
    /// Oldest peer protocol version admitted into the cluster.
    pub min_protocol_version: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::from_profile(ClusterProfile::Production)
    }
}

/// Takeover grant for a monitor interval: twice the interval, never below
/// the built-in floor.
pub fn takeover_timeout_for(monitor_interval: Duration) -> Duration {
    (monitor_interval * 2).max(Duration::from_secs(DEFAULT_TAKEOVER_PENDING_TIMEOUT_SECS))
}

impl ClusterConfig {
    pub fn from_profile(profile: ClusterProfile) -> Self {
        let secs = Duration::from_secs;
        match profile {
            ClusterProfile::Production => Self {
                lock_timeout: secs(DEFAULT_LOCK_TIMEOUT_SECS),
                wait_reply_timeout: secs(DEFAULT_WAIT_REPLY_TIMEOUT_SECS),
                wait_info_reply_timeout: secs(DEFAULT_WAIT_INFO_REPLY_TIMEOUT_SECS),
                ack_timeout: secs(DEFAULT_ACK_TIMEOUT_SECS),
                takeover_pending_timeout: takeover_timeout_for(secs(
                    DEFAULT_MONITOR_INTERVAL_SECS,
                )),
                monitor_interval: secs(DEFAULT_MONITOR_INTERVAL_SECS),
                link_init_wait: secs(DEFAULT_LINK_INIT_WAIT_SECS),
                link_deactivate_poll_interval: secs(DEFAULT_LINK_DEACTIVATE_POLL_SECS),
                max_reply_wait_interval: secs(MAX_WAIT_REPLY_INTERVAL_SECS),
                lock_max_attempts: LOCK_MAX_ATTEMPTS,
                lock_backoff_unit: Duration::from_millis(DEFAULT_LOCK_BACKOFF_UNIT_MS),
                ha_enabled: true,
                master_broker: None,
                protocol_version: CURRENT_PROTOCOL_VERSION,
                min_protocol_version: MIN_PROTOCOL_VERSION,
            },
            ClusterProfile::Development => Self {
                lock_timeout: secs(10),
                wait_reply_timeout: secs(30),
                wait_info_reply_timeout: secs(10),
                ack_timeout: secs(30),
                takeover_pending_timeout: secs(20),
                monitor_interval: secs(5),
                link_init_wait: secs(30),
                link_deactivate_poll_interval: secs(5),
                max_reply_wait_interval: secs(10),
                lock_backoff_unit: Duration::from_millis(100),
                ..Self::from_profile(ClusterProfile::Production)
            },
            ClusterProfile::Testing => {
                let ms = Duration::from_millis;
                Self {
                    lock_timeout: ms(500),
                    wait_reply_timeout: ms(1000),
                    wait_info_reply_timeout: ms(500),
                    ack_timeout: ms(1000),
                    takeover_pending_timeout: ms(1000),
                    monitor_interval: ms(200),
                    link_init_wait: ms(1000),
                    link_deactivate_poll_interval: ms(50),
                    max_reply_wait_interval: ms(200),
                    lock_backoff_unit: ms(5),
                    ..Self::from_profile(ClusterProfile::Production)
                }
            }
        }
    }

    /// Create a config from the profile named by `RAPTOR_CLUSTER_PROFILE`
    /// (default: production).
    pub fn from_profile_env() -> Self {
        let profile = std::env::var("RAPTOR_CLUSTER_PROFILE")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(ClusterProfile::Production);
        Self::from_profile(profile)
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `RAPTOR_LOCK_TIMEOUT_SECS` (default: 60)
    /// - `RAPTOR_WAIT_REPLY_TIMEOUT_SECS` (default: 180)
    /// - `RAPTOR_WAIT_INFO_REPLY_TIMEOUT_SECS` (default: 60)
    /// - `RAPTOR_ACK_TIMEOUT_SECS` (default: the wait-reply timeout)
    /// - `RAPTOR_MONITOR_INTERVAL_SECS` (default: 30)
    /// - `RAPTOR_LINK_INIT_WAIT_SECS` (default: 180)
    /// - `RAPTOR_LOCK_MAX_ATTEMPTS` (default: 10)
    /// - `RAPTOR_HA_ENABLED` (default: true)
    /// - `RAPTOR_MASTER_BROKER`: broker id of the config server (default: none)
    ///
    /// Non-numeric, zero or negative values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::from_profile(ClusterProfile::Production);

        let lock_timeout = env_secs("RAPTOR_LOCK_TIMEOUT_SECS").unwrap_or(defaults.lock_timeout);
        let wait_reply_timeout =
            env_secs("RAPTOR_WAIT_REPLY_TIMEOUT_SECS").unwrap_or(defaults.wait_reply_timeout);
        let wait_info_reply_timeout = env_secs("RAPTOR_WAIT_INFO_REPLY_TIMEOUT_SECS")
            .unwrap_or(defaults.wait_info_reply_timeout);
        let ack_timeout = env_secs("RAPTOR_ACK_TIMEOUT_SECS").unwrap_or(wait_reply_timeout);
        let monitor_interval =
            env_secs("RAPTOR_MONITOR_INTERVAL_SECS").unwrap_or(defaults.monitor_interval);
        let link_init_wait =
            env_secs("RAPTOR_LINK_INIT_WAIT_SECS").unwrap_or(defaults.link_init_wait);
        let lock_max_attempts = std::env::var("RAPTOR_LOCK_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|v| *v > 0)
            .map(|v| v.min(u32::MAX as i64) as u32)
            .unwrap_or(defaults.lock_max_attempts);
        let ha_enabled = std::env::var("RAPTOR_HA_ENABLED")
            .ok()
            .and_then(|v| v.trim().parse::<bool>().ok())
            .unwrap_or(defaults.ha_enabled);
        let master_broker = std::env::var("RAPTOR_MASTER_BROKER")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Self {
            lock_timeout,
            wait_reply_timeout,
            wait_info_reply_timeout,
            ack_timeout,
            takeover_pending_timeout: takeover_timeout_for(monitor_interval),
            monitor_interval,
            link_init_wait,
            lock_max_attempts,
            ha_enabled,
            master_broker,
            ..defaults
        }
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let timeouts = [
            ("lock_timeout", self.lock_timeout),
            ("wait_reply_timeout", self.wait_reply_timeout),
            ("wait_info_reply_timeout", self.wait_info_reply_timeout),
            ("ack_timeout", self.ack_timeout),
            ("takeover_pending_timeout", self.takeover_pending_timeout),
            ("monitor_interval", self.monitor_interval),
            ("link_init_wait", self.link_init_wait),
            (
                "link_deactivate_poll_interval",
                self.link_deactivate_poll_interval,
            ),
            ("max_reply_wait_interval", self.max_reply_wait_interval),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                errors.push(format!("{} must be greater than zero", name));
            }
        }

        if self.lock_max_attempts == 0 {
            errors.push("lock_max_attempts must be at least 1".to_string());
        }

        if self.link_deactivate_poll_interval > self.link_init_wait {
            errors.push(format!(
                "link_deactivate_poll_interval ({:?}) must not exceed link_init_wait ({:?})",
                self.link_deactivate_poll_interval, self.link_init_wait
            ));
        }

        if self.takeover_pending_timeout < self.monitor_interval {
            errors.push(format!(
                "takeover_pending_timeout ({:?}) must be at least monitor_interval ({:?})",
                self.takeover_pending_timeout, self.monitor_interval
            ));
        }

        if self.protocol_version < self.min_protocol_version {
            errors.push(format!(
                "protocol_version ({}) is below min_protocol_version ({})",
                self.protocol_version, self.min_protocol_version
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
        .map(|v| Duration::from_secs(v as u64))
}
