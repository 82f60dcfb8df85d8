//! Prometheus metrics for the cluster coordination layer.
//!
//! | Area | Metrics |
//! |------|---------|
//! | Reply tracking | `active_reply_waiters`, `reply_wait_duration_seconds`, `unmatched_replies_total` |
//! | Resource election | `lock_elections_total`, `lock_election_attempts` |
//! | Takeover and migration | `takeover_events_total`, `master_migrations_total`, `config_change_events_total` |
//! | Membership | `broker_info_decisions_total`, `live_brokers`, `handler_errors_total` |
//!
//! Everything lives in [`REGISTRY`], whose names carry the `raptor_`
//! prefix, so the embedding broker can export it next to its own registry.

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Registry,
    TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for cluster metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("raptor".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// Each `define_*!` declares a lazily registered static:
//
//   define_gauge!(NAME, "metric_name", "help");
//   define_gauge_vec!(NAME, "metric_name", "help", ["label"]);
//   define_counter_vec!(NAME, "metric_name", "help", ["label"]);
//   define_histogram_vec!(NAME, "metric_name", "help", ["label"], [0.1, 1.0]);

macro_rules! define_gauge {
    ($name:ident, $metric:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register($metric, IntGauge::new($metric, $help)));
    };
}

macro_rules! define_gauge_vec {
    ($name:ident, $metric:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register($metric, IntGaugeVec::new(opts!($metric, $help), &[$($label),+]))
        });
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register($metric, IntCounterVec::new(opts!($metric, $help), &[$($label),+]))
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register(
                $metric,
                HistogramVec::new(
                    HistogramOpts::new($metric, $help).buckets(vec![$($bucket),+]),
                    &[$($label),+],
                ),
            )
        });
    };
}

// =============================================================================
// Reply tracking
// =============================================================================

define_gauge_vec!(
    ACTIVE_REPLY_WAITERS,
    "active_reply_waiters",
    "Number of registered reply waiters per tracker",
    ["tracker"]
);
define_histogram_vec!(
    REPLY_WAIT_DURATION,
    "reply_wait_duration_seconds",
    "Time spent waiting for correlated replies",
    ["kind", "status"],
    [0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 180.0]
);
define_counter_vec!(
    UNMATCHED_REPLIES,
    "unmatched_replies_total",
    "Replies that arrived with no registered waiter",
    ["tracker"]
);

// =============================================================================
// Resource election
// =============================================================================

define_counter_vec!(
    LOCK_ELECTIONS,
    "lock_elections_total",
    "Completed resource elections by final result",
    ["result"]
);
define_histogram_vec!(
    LOCK_ELECTION_ATTEMPTS,
    "lock_election_attempts",
    "Number of voting rounds per resource election",
    ["result"],
    [1.0, 2.0, 3.0, 5.0, 8.0, 10.0]
);

// =============================================================================
// Takeover, migration and config change
// =============================================================================

define_counter_vec!(
    TAKEOVER_EVENTS,
    "takeover_events_total",
    "Takeover lifecycle events",
    ["event"]
);
define_counter_vec!(
    MASTER_MIGRATIONS,
    "master_migrations_total",
    "Master broker migrations by result",
    ["result"]
);
define_counter_vec!(
    CONFIG_CHANGE_EVENTS,
    "config_change_events_total",
    "Config change events sent to the master broker by result",
    ["result"]
);

// =============================================================================
// Membership
// =============================================================================

define_counter_vec!(
    BROKER_INFO_DECISIONS,
    "broker_info_decisions_total",
    "Admission decisions for joining brokers",
    ["decision"]
);
define_gauge!(
    LIVE_BROKERS,
    "live_brokers",
    "Number of brokers in the live broker list"
);
define_counter_vec!(
    HANDLER_ERRORS,
    "handler_errors_total",
    "Inbound packets whose handler returned an error",
    ["packet"]
);

/// Register `metric` with [`REGISTRY`].
///
/// A metric that fails to register (duplicate name) is still returned so
/// recording keeps working; it is just not exported. Invalid names and
/// labels are programming errors and panic on first access.
fn register<M>(name: &str, metric: prometheus::Result<M>) -> M
where
    M: Collector + Clone + 'static,
{
    let metric = metric.unwrap_or_else(|e| panic!("invalid definition for metric {name}: {e}"));
    if let Err(e) = REGISTRY.register(Box::new(metric.clone())) {
        warn!(name, error = %e, "Metric not registered, recording to an unexported copy");
    }
    metric
}

/// Register every metric up front so a scrape before the first event
/// already lists them. Safe to call repeatedly.
pub fn init_metrics() {
    let _ = &*ACTIVE_REPLY_WAITERS;
    let _ = &*REPLY_WAIT_DURATION;
    let _ = &*UNMATCHED_REPLIES;
    let _ = &*LOCK_ELECTIONS;
    let _ = &*LOCK_ELECTION_ATTEMPTS;
    let _ = &*TAKEOVER_EVENTS;
    let _ = &*MASTER_MIGRATIONS;
    let _ = &*CONFIG_CHANGE_EVENTS;
    let _ = &*BROKER_INFO_DECISIONS;
    let _ = &*LIVE_BROKERS;
    let _ = &*HANDLER_ERRORS;
}

/// Render every cluster metric in the Prometheus text exposition format,
/// for the embedding broker's scrape endpoint.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let mut out = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut out)?;
    Ok(String::from_utf8(out)?)
}

// =============================================================================
// Recording helpers
// =============================================================================

/// Record one completed reply wait.
pub fn record_reply_wait(kind: &str, status: &str, duration_secs: f64) {
    REPLY_WAIT_DURATION
        .with_label_values(&[kind, status])
        .observe(duration_secs);
}

pub fn record_unmatched_reply(tracker: &str) {
    UNMATCHED_REPLIES.with_label_values(&[tracker]).inc();
}

/// Record the final result of a resource election.
pub fn record_lock_election(result: &str, attempts: u32) {
    LOCK_ELECTIONS.with_label_values(&[result]).inc();
    LOCK_ELECTION_ATTEMPTS
        .with_label_values(&[result])
        .observe(attempts as f64);
}

pub fn record_takeover_event(event: &str) {
    TAKEOVER_EVENTS.with_label_values(&[event]).inc();
}

pub fn record_master_migration(result: &str) {
    MASTER_MIGRATIONS.with_label_values(&[result]).inc();
}

pub fn record_config_change_event(result: &str) {
    CONFIG_CHANGE_EVENTS.with_label_values(&[result]).inc();
}

pub fn record_broker_info_decision(decision: &str) {
    BROKER_INFO_DECISIONS.with_label_values(&[decision]).inc();
}

pub fn set_live_brokers(count: usize) {
    LIVE_BROKERS.set(count as i64);
}

pub fn record_handler_error(packet: &str) {
    HANDLER_ERRORS.with_label_values(&[packet]).inc();
}
