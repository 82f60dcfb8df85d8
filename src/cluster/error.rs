//! Error types for the cluster coordination layer.
//!
//! # Error Handling Patterns
//!
//! The coordination layer uses two patterns based on the protocol involved:
//!
//! ## Surface to the Caller
//!
//! The reply-tracking layer never retries. A request that cannot complete
//! resolves to [`ClusterError::Reply`] carrying the terminal [`Status`]
//! (`Timeout`, `Gone`, or the status the peer answered with). The caller
//! decides what to do next:
//! - Takeover restarts its convergecast or aborts the takeover
//! - Message acknowledgement marks the message home broker down
//! - Master broker migration fails the administrative request
//!
//! ## Retry Internally
//!
//! Election contention (`BACKOFF`, `TRY_AGAIN`) is retried inside
//! `lock_resource` with bounded attempts and never reaches the caller as an
//! error. Exhausted attempts surface as a plain `FAILURE` vote result.
//!
//! # Handler Failures
//!
//! An error raised while handling an inbound packet is logged and answered
//! with a reply whose status is [`ClusterError::status`], so waiters on the
//! sending broker always resolve.

use thiserror::Error;

use super::address::BrokerAddress;
use super::packet::PacketType;
use super::status::Status;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors raised by the cluster coordination layer.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A correlated request resolved to a non-OK status.
    #[error("{status} waiting for {packet} reply: {reason}")]
    Reply {
        packet: PacketType,
        status: Status,
        reason: String,
    },

    /// The message home broker is unreachable, goodbyed or being taken over.
    #[error("Broker {broker} is down: {reason}")]
    BrokerDown { broker: String, reason: String },

    /// The operation must run on the master broker.
    #[error("This broker is not the master broker (master: {master})")]
    NotMaster { master: String },

    /// No master broker address is known yet.
    #[error("Master broker {0} not resolved yet")]
    MasterNotResolved(String),

    /// Config sync with the master broker has not completed.
    #[error("Config sync with master broker {0} not complete")]
    ConfigSyncIncomplete(String),

    /// The cluster is not in a state that allows the operation.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// A master broker migration is in progress.
    #[error("Master broker migration in progress")]
    MigrationInProgress,

    /// The caller passed an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The broker targeted by an operation is not connected.
    #[error("Broker {0} is not connected")]
    NotConnected(BrokerAddress),

    /// Transport send failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Change record store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Malformed or unexpected packet.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Change record (de)serialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The engine is shutting down.
    #[error("Cluster protocol is shutting down")]
    Shutdown,
}

impl ClusterError {
    /// Convenience constructor for reply failures.
    pub fn reply(packet: PacketType, status: Status, reason: impl Into<String>) -> Self {
        ClusterError::Reply {
            packet,
            status,
            reason: reason.into(),
        }
    }

    /// Wire status used when this error answers a request.
    ///
    /// | ClusterError          | Status               |
    /// |-----------------------|----------------------|
    /// | Reply                 | carried status       |
    /// | BrokerDown            | Gone                 |
    /// | NotMaster             | NotAllowed           |
    /// | MasterNotResolved     | Unavailable          |
    /// | ConfigSyncIncomplete  | Unavailable          |
    /// | Precondition          | PreconditionFailed   |
    /// | MigrationInProgress   | Retry                |
    /// | InvalidArgument       | BadRequest           |
    /// | NotConnected          | Gone                 |
    /// | Protocol / Serde      | BadRequest           |
    /// | Transport / Store     | Error                |
    /// | Shutdown              | Unavailable          |
    pub fn status(&self) -> Status {
        match self {
            ClusterError::Reply { status, .. } => *status,
            ClusterError::BrokerDown { .. } => Status::Gone,
            ClusterError::NotMaster { .. } => Status::NotAllowed,
            ClusterError::MasterNotResolved(_) => Status::Unavailable,
            ClusterError::ConfigSyncIncomplete(_) => Status::Unavailable,
            ClusterError::Precondition(_) => Status::PreconditionFailed,
            ClusterError::MigrationInProgress => Status::Retry,
            ClusterError::InvalidArgument(_) => Status::BadRequest,
            ClusterError::NotConnected(_) => Status::Gone,
            ClusterError::Protocol(_) => Status::BadRequest,
            ClusterError::Serde(_) => Status::BadRequest,
            ClusterError::Transport(_) => Status::Error,
            ClusterError::Store(_) => Status::Error,
            ClusterError::Shutdown => Status::Unavailable,
        }
    }

    /// True if the peer needed to complete the operation went away.
    #[inline]
    pub fn is_gone(&self) -> bool {
        matches!(self.status(), Status::Gone)
    }

    /// True if the operation timed out waiting on a peer.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self.status(), Status::Timeout)
    }

    /// Check if a later attempt could succeed without operator action.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        match self {
            ClusterError::Reply { status, .. } => {
                matches!(status, Status::Timeout | Status::Retry | Status::Unavailable)
            }
            ClusterError::MigrationInProgress => true,
            ClusterError::MasterNotResolved(_) => true,
            ClusterError::ConfigSyncIncomplete(_) => true,
            ClusterError::Transport(_) => true,

            ClusterError::BrokerDown { .. } => false,
            ClusterError::NotMaster { .. } => false,
            ClusterError::Precondition(_) => false,
            ClusterError::InvalidArgument(_) => false,
            ClusterError::NotConnected(_) => false,
            ClusterError::Store(_) => false,
            ClusterError::Protocol(_) => false,
            ClusterError::Serde(_) => false,
            ClusterError::Shutdown => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_error_carries_status() {
        let err = ClusterError::reply(PacketType::MessageAckReply, Status::Gone, "link down");
        assert_eq!(err.status(), Status::Gone);
        assert!(err.is_gone());
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("MESSAGE_ACK_REPLY"));
    }

    #[test]
    fn test_timeout_reply_is_retriable() {
        let err = ClusterError::reply(PacketType::TakeoverPendingReply, Status::Timeout, "");
        assert!(err.is_timeout());
        assert!(err.is_retriable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ClusterError::MigrationInProgress.status(), Status::Retry);
        assert_eq!(
            ClusterError::NotMaster {
                master: "b1".into()
            }
            .status(),
            Status::NotAllowed
        );
        assert_eq!(
            ClusterError::Protocol("missing X".into()).status(),
            Status::BadRequest
        );
        assert_eq!(
            ClusterError::BrokerDown {
                broker: "b2".into(),
                reason: "goodbyed".into()
            }
            .status(),
            Status::Gone
        );
    }

    #[test]
    fn test_serde_error_converts() {
        let parse: Result<u32, _> = serde_json::from_str("not json");
        let err: ClusterError = parse.unwrap_err().into();
        assert!(matches!(err, ClusterError::Serde(_)));
        assert_eq!(err.status(), Status::BadRequest);
    }
}
