//! Centralized protocol and configuration constants.
//!
//! This module consolidates the magic numbers used by the cluster
//! coordination layer. Having them in one place makes it easier to:
//!
//! - Understand the protocol limits
//! - Update values consistently
//! - Keep defaults and validation in agreement
//!
//! # Categories
//!
//! - **Timeout Defaults**: built-in fallbacks when a timeout is unset
//! - **Election Constants**: resource lock election limits
//! - **Takeover Constants**: store-session takeover timing
//! - **Packet Property Names**: well-known property keys on cluster packets

// =============================================================================
// Timeout Defaults
// =============================================================================

/// Default time to wait for every vote of one resource lock election round.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;

/// Default time to wait for a reply to a cluster request.
pub const DEFAULT_WAIT_REPLY_TIMEOUT_SECS: u64 = 180;

/// Default time to wait for an INFO reply (store session owner lookups).
pub const DEFAULT_WAIT_INFO_REPLY_TIMEOUT_SECS: u64 = 60;

/// Default time to wait for a message acknowledgement reply.
///
/// Mirrors the wait-reply timeout unless configured separately.
pub const DEFAULT_ACK_TIMEOUT_SECS: u64 = DEFAULT_WAIT_REPLY_TIMEOUT_SECS;

/// Default HA monitor interval.
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 30;

/// Floor for the takeover pending grant.
///
/// The effective grant is `2 * monitor_interval`, never less than this.
pub const DEFAULT_TAKEOVER_PENDING_TIMEOUT_SECS: u64 = 2 * DEFAULT_MONITOR_INTERVAL_SECS;

/// Maximum time to wait for a force-closed broker link to deactivate.
pub const DEFAULT_LINK_INIT_WAIT_SECS: u64 = 180;

/// Poll interval while waiting for a broker link to deactivate.
pub const DEFAULT_LINK_DEACTIVATE_POLL_SECS: u64 = 15;

/// Upper bound on a single condition wait inside any deadline loop.
pub const MAX_WAIT_REPLY_INTERVAL_SECS: u64 = 60;

// =============================================================================
// Election Constants
// =============================================================================

/// Number of election attempts before a contended lock gives up with FAILURE.
pub const LOCK_MAX_ATTEMPTS: u32 = 10;

/// Unit of the binary exponential backoff between contended election attempts.
pub const DEFAULT_LOCK_BACKOFF_UNIT_MS: u64 = 1000;

/// Resource name prefix for destination exclusive-consumer locks.
///
/// Elections on these names report TIMEOUT as soon as the deadline passes,
/// without the extra reachability round.
pub const DESTINATION_EXCLUSIVE_LOCK_PREFIX: &str = "queue:";

/// Resource name prefix for client ID locks.
pub const CLIENTID_EXCLUSIVE_LOCK_PREFIX: &str = "clientid:";

/// Resource name prefix for durable subscription locks.
pub const DURABLE_LOCK_PREFIX: &str = "durable:";

// =============================================================================
// Protocol Versions
// =============================================================================

/// Cluster protocol version spoken by this implementation.
pub const CURRENT_PROTOCOL_VERSION: u32 = 500;

/// Oldest peer protocol version admitted into the cluster.
pub const MIN_PROTOCOL_VERSION: u32 = 410;

/// Protocol version required of a broker to become the master broker.
pub const MIN_MASTER_MIGRATION_VERSION: u32 = 500;

// =============================================================================
// Packet Property Names
// =============================================================================

/// Correlation id.
pub const PROP_XID: &str = "X";
/// Reply status code.
pub const PROP_STATUS: &str = "S";
/// Reply reason text.
pub const PROP_REASON: &str = "reason";
/// Resource id on LOCK and LOCK_REPLY.
pub const PROP_RESOURCE: &str = "I";
/// Resource creation timestamp on LOCK.
pub const PROP_TIMESTAMP: &str = "TS";
/// Shared lock flag on LOCK.
pub const PROP_SHARED: &str = "SH";
/// Broker id of a takeover target.
pub const PROP_BROKER_ID: &str = "brokerID";
/// Store session of a takeover target.
pub const PROP_STORE_SESSION: &str = "storeSession";
/// Host of the takeover target incarnation.
pub const PROP_BROKER_HOST: &str = "brokerHost";
/// Broker session of the takeover target incarnation.
pub const PROP_BROKER_SESSION: &str = "brokerSession";
/// Marks a takeover packet as sent (or relayed) on behalf of the taker.
pub const PROP_FROM_TAKER: &str = "fromTaker";
/// Marks a takeover announced after the target's heartbeat timed out.
pub const PROP_TIMED_OUT: &str = "timedout";
/// Number of change records in a NEW_MASTER_BROKER_PREPARE payload.
pub const PROP_RECORD_COUNT: &str = "C";
/// Migration uuid shared by prepare and commit.
pub const PROP_UUID: &str = "UUID";
/// Broker id of the new master broker.
pub const PROP_NEW_MASTER: &str = "newMaster";
/// Broker id of the old master broker.
pub const PROP_OLD_MASTER: &str = "oldMaster";
/// Last refresh timestamp on GET_CONFIG_CHANGES_REQUEST.
pub const PROP_SINCE: &str = "since";
/// Store session queried by INFO_REQUEST.
pub const PROP_QUERY_STORE_SESSION: &str = "querySession";
/// Owner broker id returned on INFO.
pub const PROP_OWNER: &str = "owner";
/// Message acknowledgement type.
pub const PROP_ACK_TYPE: &str = "ackType";

/// Timestamp value meaning "send every record".
pub const SYNC_FROM_START: i64 = -1;
