//! Broker identity.
//!
//! A [`BrokerAddress`] names one broker *incarnation*. Two notions of
//! sameness matter to the protocols:
//!
//! - [`BrokerAddress::same_broker`]: same broker id, regardless of restarts
//! - [`BrokerAddress::same_store_session`]: same persistent store session
//!
//! `Eq`/`Hash` combine broker id and broker session, so a restarted broker
//! is a distinct member of the live broker list.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Address of a broker process in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAddress {
    /// Stable broker id.
    pub broker_id: String,
    /// Host the broker listens on.
    pub host: String,
    /// Cluster service port.
    pub port: u16,
    /// Store session currently owned by the broker.
    pub store_session: u64,
    /// Process incarnation; changes on every restart.
    pub broker_session: u64,
    /// Whether the broker runs in HA mode.
    pub ha_enabled: bool,
}

impl BrokerAddress {
    pub fn new(
        broker_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        store_session: u64,
        broker_session: u64,
    ) -> Self {
        Self {
            broker_id: broker_id.into(),
            host: host.into(),
            port,
            store_session,
            broker_session,
            ha_enabled: true,
        }
    }

    /// Builder-style override of the HA flag.
    pub fn with_ha(mut self, ha_enabled: bool) -> Self {
        self.ha_enabled = ha_enabled;
        self
    }

    /// Same broker id.
    pub fn same_broker(&self, other: &BrokerAddress) -> bool {
        self.broker_id == other.broker_id
    }

    /// Same persistent store session.
    pub fn same_store_session(&self, other: &BrokerAddress) -> bool {
        self.store_session == other.store_session
    }
}

impl PartialEq for BrokerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.broker_id == other.broker_id && self.broker_session == other.broker_session
    }
}

impl Eq for BrokerAddress {}

impl Hash for BrokerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.broker_id.hash(state);
        self.broker_session.hash(state);
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}:{}({})",
            self.broker_id, self.host, self.port, self.broker_session
        )
    }
}

/// Handshake information a peer presents when its link comes up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub address: BrokerAddress,
    /// Cluster protocol version; `None` for legacy brokers.
    pub protocol_version: Option<u32>,
    /// The peer changed config while disconnected from the master.
    pub store_dirty: bool,
    /// Remote socket address as seen by the transport.
    pub real_remote: Option<String>,
}

impl BrokerInfo {
    pub fn new(address: BrokerAddress, protocol_version: u32) -> Self {
        Self {
            address,
            protocol_version: Some(protocol_version),
            store_dirty: false,
            real_remote: None,
        }
    }
}

impl std::fmt::Display for BrokerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.real_remote {
            Some(remote) => write!(f, "{}[{}]", self.address, remote),
            None => write!(f, "{}", self.address),
        }
    }
}
