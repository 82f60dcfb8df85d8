//! Wire status codes and election outcomes.
//!
//! [`Status`] travels in the `S` property of every reply packet. Callers of
//! [`ReplyTracker::wait_for_reply`](super::ReplyTracker::wait_for_reply) see
//! it through [`ClusterError::Reply`](super::ClusterError::Reply) when a
//! request does not resolve OK.
//!
//! [`LockStatus`] is the vote and result vocabulary of the resource election.

use serde::{Deserialize, Serialize};

/// Status code carried on reply packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Ok,
    BadRequest,
    NotAllowed,
    NotFound,
    Timeout,
    Conflict,
    Gone,
    PreconditionFailed,
    Error,
    Unavailable,
    Retry,
}

impl Status {
    /// Numeric wire code (HTTP-style).
    pub fn code(self) -> i32 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::NotAllowed => 405,
            Status::NotFound => 404,
            Status::Timeout => 408,
            Status::Conflict => 409,
            Status::Gone => 410,
            Status::PreconditionFailed => 412,
            Status::Error => 500,
            Status::Unavailable => 503,
            Status::Retry => 449,
        }
    }

    /// Decode a wire code. Unknown codes map to [`Status::Error`].
    pub fn from_code(code: i32) -> Self {
        match code {
            200 => Status::Ok,
            400 => Status::BadRequest,
            405 => Status::NotAllowed,
            404 => Status::NotFound,
            408 => Status::Timeout,
            409 => Status::Conflict,
            410 => Status::Gone,
            412 => Status::PreconditionFailed,
            503 => Status::Unavailable,
            449 => Status::Retry,
            _ => Status::Error,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Label for metrics.
    pub fn as_metric_label(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::BadRequest => "bad_request",
            Status::NotAllowed => "not_allowed",
            Status::NotFound => "not_found",
            Status::Timeout => "timeout",
            Status::Conflict => "conflict",
            Status::Gone => "gone",
            Status::PreconditionFailed => "precondition_failed",
            Status::Error => "error",
            Status::Unavailable => "unavailable",
            Status::Retry => "retry",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.as_metric_label().to_uppercase(), self.code())
    }
}

/// Vote or outcome of a resource lock election.
///
/// Peers vote with `Success`, `Failure` or `Backoff`. `TryAgain` and
/// `Timeout` are produced locally by the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockStatus {
    Timeout,
    Success,
    Failure,
    Backoff,
    TryAgain,
}

impl LockStatus {
    pub fn code(self) -> i32 {
        match self {
            LockStatus::Timeout => -1,
            LockStatus::Success => 0,
            LockStatus::Failure => 1,
            LockStatus::Backoff => 2,
            LockStatus::TryAgain => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(LockStatus::Timeout),
            0 => Some(LockStatus::Success),
            1 => Some(LockStatus::Failure),
            2 => Some(LockStatus::Backoff),
            3 => Some(LockStatus::TryAgain),
            _ => None,
        }
    }

    pub fn as_metric_label(self) -> &'static str {
        match self {
            LockStatus::Timeout => "timeout",
            LockStatus::Success => "success",
            LockStatus::Failure => "failure",
            LockStatus::Backoff => "backoff",
            LockStatus::TryAgain => "try_again",
        }
    }
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockStatus::Timeout => write!(f, "LOCK_TIMEOUT"),
            LockStatus::Success => write!(f, "LOCK_SUCCESS"),
            LockStatus::Failure => write!(f, "LOCK_FAILURE"),
            LockStatus::Backoff => write!(f, "LOCK_BACKOFF"),
            LockStatus::TryAgain => write!(f, "LOCK_TRY_AGAIN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_roundtrip_known_values() {
        for status in [
            Status::Ok,
            Status::Timeout,
            Status::Gone,
            Status::Error,
            Status::Retry,
            Status::NotFound,
        ] {
            assert_eq!(Status::from_code(status.code()), status);
        }
    }

    #[test]
    fn test_unknown_status_code_is_error() {
        assert_eq!(Status::from_code(999), Status::Error);
        assert_eq!(Status::from_code(-5), Status::Error);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Gone.to_string(), "GONE(410)");
        assert_eq!(Status::Ok.to_string(), "OK(200)");
    }

    #[test]
    fn test_lock_status_codes() {
        assert_eq!(LockStatus::from_code(2), Some(LockStatus::Backoff));
        assert_eq!(LockStatus::from_code(-1), Some(LockStatus::Timeout));
        assert_eq!(LockStatus::from_code(7), None);
        assert_eq!(LockStatus::TryAgain.to_string(), "LOCK_TRY_AGAIN");
    }
}
