//! Cluster packet model.
//!
//! The coordination core depends only on the *shape* of a cluster packet:
//! a type code, an ordered bag of named typed properties, an optional binary
//! payload and two flags. Marshaling to bytes is the transport's concern.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┬──────────┬───────────┐
//! │ PacketType   │ props: [(name, PropValue)..] │ payload? │ flags     │
//! │ LOCK (11)    │ I="durable:foo" TS=100 X=..  │ -        │ reply     │
//! └──────────────┴──────────────────────────────┴──────────┴───────────┘
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{ClusterError, ClusterResult};
use super::status::Status;
use crate::constants::{PROP_REASON, PROP_STATUS, PROP_XID};

/// Cluster packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    Lock,
    LockReply,
    TakeoverPending,
    TakeoverPendingReply,
    TakeoverComplete,
    TakeoverAbort,
    NewMasterBrokerPrepare,
    NewMasterBrokerPrepareReply,
    NewMasterBroker,
    NewMasterBrokerReply,
    ConfigChangeEvent,
    ConfigChangeEventReply,
    GetConfigChangesRequest,
    GetConfigChangesReply,
    MessageAck,
    MessageAckReply,
    InfoRequest,
    Info,
    Goodbye,
    GoodbyeReply,
}

impl PacketType {
    /// Numeric type code.
    pub fn code(self) -> u16 {
        match self {
            PacketType::Lock => 11,
            PacketType::LockReply => 12,
            PacketType::ConfigChangeEvent => 19,
            PacketType::ConfigChangeEventReply => 20,
            PacketType::GetConfigChangesRequest => 21,
            PacketType::GetConfigChangesReply => 22,
            PacketType::MessageAck => 29,
            PacketType::MessageAckReply => 30,
            PacketType::Goodbye => 41,
            PacketType::GoodbyeReply => 42,
            PacketType::TakeoverComplete => 43,
            PacketType::TakeoverPending => 44,
            PacketType::TakeoverPendingReply => 45,
            PacketType::TakeoverAbort => 46,
            PacketType::InfoRequest => 51,
            PacketType::Info => 52,
            PacketType::NewMasterBrokerPrepare => 61,
            PacketType::NewMasterBrokerPrepareReply => 62,
            PacketType::NewMasterBroker => 63,
            PacketType::NewMasterBrokerReply => 64,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.code() == code)
    }

    pub fn all() -> &'static [PacketType] {
        &[
            PacketType::Lock,
            PacketType::LockReply,
            PacketType::TakeoverPending,
            PacketType::TakeoverPendingReply,
            PacketType::TakeoverComplete,
            PacketType::TakeoverAbort,
            PacketType::NewMasterBrokerPrepare,
            PacketType::NewMasterBrokerPrepareReply,
            PacketType::NewMasterBroker,
            PacketType::NewMasterBrokerReply,
            PacketType::ConfigChangeEvent,
            PacketType::ConfigChangeEventReply,
            PacketType::GetConfigChangesRequest,
            PacketType::GetConfigChangesReply,
            PacketType::MessageAck,
            PacketType::MessageAckReply,
            PacketType::InfoRequest,
            PacketType::Info,
            PacketType::Goodbye,
            PacketType::GoodbyeReply,
        ]
    }

    /// Reply type for request packets, `None` for replies and notifications.
    pub fn reply_type(self) -> Option<PacketType> {
        match self {
            PacketType::Lock => Some(PacketType::LockReply),
            PacketType::TakeoverPending => Some(PacketType::TakeoverPendingReply),
            PacketType::NewMasterBrokerPrepare => Some(PacketType::NewMasterBrokerPrepareReply),
            PacketType::NewMasterBroker => Some(PacketType::NewMasterBrokerReply),
            PacketType::ConfigChangeEvent => Some(PacketType::ConfigChangeEventReply),
            PacketType::GetConfigChangesRequest => Some(PacketType::GetConfigChangesReply),
            PacketType::MessageAck => Some(PacketType::MessageAckReply),
            PacketType::InfoRequest => Some(PacketType::Info),
            PacketType::Goodbye => Some(PacketType::GoodbyeReply),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::Lock => "LOCK",
            PacketType::LockReply => "LOCK_REPLY",
            PacketType::TakeoverPending => "TAKEOVER_PENDING",
            PacketType::TakeoverPendingReply => "TAKEOVER_PENDING_REPLY",
            PacketType::TakeoverComplete => "TAKEOVER_COMPLETE",
            PacketType::TakeoverAbort => "TAKEOVER_ABORT",
            PacketType::NewMasterBrokerPrepare => "NEW_MASTER_BROKER_PREPARE",
            PacketType::NewMasterBrokerPrepareReply => "NEW_MASTER_BROKER_PREPARE_REPLY",
            PacketType::NewMasterBroker => "NEW_MASTER_BROKER",
            PacketType::NewMasterBrokerReply => "NEW_MASTER_BROKER_REPLY",
            PacketType::ConfigChangeEvent => "CONFIG_CHANGE_EVENT",
            PacketType::ConfigChangeEventReply => "CONFIG_CHANGE_EVENT_REPLY",
            PacketType::GetConfigChangesRequest => "GET_CONFIG_CHANGES_REQUEST",
            PacketType::GetConfigChangesReply => "GET_CONFIG_CHANGES_REPLY",
            PacketType::MessageAck => "MESSAGE_ACK",
            PacketType::MessageAckReply => "MESSAGE_ACK_REPLY",
            PacketType::InfoRequest => "INFO_REQUEST",
            PacketType::Info => "INFO",
            PacketType::Goodbye => "GOODBYE",
            PacketType::GoodbyeReply => "GOODBYE_REPLY",
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Str(String),
    Bytes(Bytes),
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl From<i32> for PropValue {
    fn from(v: i32) -> Self {
        PropValue::Int(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Long(v)
    }
}

impl From<u64> for PropValue {
    fn from(v: u64) -> Self {
        PropValue::Long(v as i64)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Str(v.to_string())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Str(v)
    }
}

/// An addressed cluster message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPacket {
    pub packet_type: PacketType,
    props: Vec<(String, PropValue)>,
    pub payload: Option<Bytes>,
    /// Receiver must answer.
    pub reply_requested: bool,
    /// Packet is delivered to every member.
    pub broadcast: bool,
}

impl ClusterPacket {
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            props: Vec::new(),
            payload: None,
            reply_requested: false,
            broadcast: false,
        }
    }

    /// Build a reply to `request`, copying its correlation id.
    pub fn reply_to(
        request: &ClusterPacket,
        reply_type: PacketType,
        status: Status,
        reason: Option<&str>,
    ) -> Self {
        let mut reply = ClusterPacket::new(reply_type);
        if let Some(xid) = request.xid_opt() {
            reply.put(PROP_XID, xid);
        }
        reply.put(PROP_STATUS, status.code());
        if let Some(reason) = reason {
            reply.put(PROP_REASON, reason);
        }
        reply
    }

    /// Set a property, replacing an existing value in place.
    pub fn put(&mut self, name: &str, value: impl Into<PropValue>) {
        let value = value.into();
        match self.props.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.props.push((name.to_string(), value)),
        }
    }

    /// Builder-style [`put`](Self::put).
    pub fn with(mut self, name: &str, value: impl Into<PropValue>) -> Self {
        self.put(name, value);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_reply_requested(mut self) -> Self {
        self.reply_requested = true;
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.props.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn props(&self) -> impl Iterator<Item = (&str, &PropValue)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_long(&self, name: &str) -> ClusterResult<i64> {
        match self.get(name) {
            Some(PropValue::Long(v)) => Ok(*v),
            Some(PropValue::Int(v)) => Ok(i64::from(*v)),
            Some(other) => Err(self.mistyped(name, "long", other)),
            None => Err(self.missing(name)),
        }
    }

    pub fn get_int(&self, name: &str) -> ClusterResult<i32> {
        match self.get(name) {
            Some(PropValue::Int(v)) => Ok(*v),
            Some(other) => Err(self.mistyped(name, "int", other)),
            None => Err(self.missing(name)),
        }
    }

    pub fn get_bool(&self, name: &str) -> ClusterResult<bool> {
        match self.get(name) {
            Some(PropValue::Bool(v)) => Ok(*v),
            Some(other) => Err(self.mistyped(name, "bool", other)),
            None => Err(self.missing(name)),
        }
    }

    /// Boolean property, `false` when absent.
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some(PropValue::Bool(true)))
    }

    pub fn get_str(&self, name: &str) -> ClusterResult<&str> {
        match self.get(name) {
            Some(PropValue::Str(v)) => Ok(v.as_str()),
            Some(other) => Err(self.mistyped(name, "string", other)),
            None => Err(self.missing(name)),
        }
    }

    pub fn get_str_opt(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(PropValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Correlation id (`X`).
    pub fn xid(&self) -> ClusterResult<u64> {
        self.get_long(PROP_XID).map(|x| x as u64)
    }

    pub fn xid_opt(&self) -> Option<u64> {
        self.xid().ok()
    }

    /// Reply status (`S`). A reply without a status is an error.
    pub fn status(&self) -> Status {
        match self.get(PROP_STATUS) {
            Some(PropValue::Int(code)) => Status::from_code(*code),
            _ => Status::Error,
        }
    }

    /// Reply reason, empty when absent.
    pub fn reason(&self) -> &str {
        self.get_str_opt(PROP_REASON).unwrap_or("")
    }

    fn missing(&self, name: &str) -> ClusterError {
        ClusterError::Protocol(format!(
            "{} packet missing property {}",
            self.packet_type, name
        ))
    }

    fn mistyped(&self, name: &str, expected: &str, found: &PropValue) -> ClusterError {
        ClusterError::Protocol(format!(
            "{} packet property {} expected {}, found {:?}",
            self.packet_type, name, expected, found
        ))
    }
}

impl std::fmt::Display for ClusterPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[", self.packet_type)?;
        for (i, (k, v)) in self.props.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match v {
                PropValue::Bool(b) => write!(f, "{}={}", k, b)?,
                PropValue::Int(n) => write!(f, "{}={}", k, n)?,
                PropValue::Long(n) => write!(f, "{}={}", k, n)?,
                PropValue::Str(s) => write!(f, "{}={}", k, s)?,
                PropValue::Bytes(b) => write!(f, "{}=<{} bytes>", k, b.len())?,
            }
        }
        write!(f, "]")
    }
}
