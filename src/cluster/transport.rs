//! Collaborator traits the protocol engine is built on.
//!
//! The engine never opens sockets, persists records or runs broker
//! lifecycle code itself. Those concerns sit behind three seams:
//!
//! - [`Transport`]: broker-to-broker packet delivery and link control
//! - [`ConfigChangeStore`]: the master broker's change-record log
//! - [`BrokerCallbacks`]: hooks into the surrounding broker
//!
//! # Available Implementations
//!
//! - [`MockNetwork`](super::mock_transport::MockNetwork): in-memory cluster
//!   for tests (`test-utilities` feature)
//! - [`MemoryConfigStore`](super::mock_transport::MemoryConfigStore)
//! - [`RecordingCallbacks`](super::mock_transport::RecordingCallbacks)

use std::time::Duration;

use async_trait::async_trait;

use super::address::{BrokerAddress, BrokerInfo};
use super::change_record::ChangeRecord;
use super::error::ClusterResult;
use super::packet::ClusterPacket;
use super::status::Status;

/// Identity of one incarnation of a broker link.
///
/// A link that is closed and re-established gets a new id, which is how an
/// election round notices that membership changed under it.
pub type LinkId = u64;

/// Packet delivery between brokers.
#[async_trait]
pub trait Transport: Send + Sync {
    // ========================================================================
    // Delivery
    // ========================================================================

    /// Send a packet to one broker.
    async fn unicast(&self, to: &BrokerAddress, packet: ClusterPacket) -> ClusterResult<()>;

    /// Send a packet to one broker ahead of queued traffic.
    async fn unicast_urgent(&self, to: &BrokerAddress, packet: ClusterPacket) -> ClusterResult<()> {
        self.unicast(to, packet).await
    }

    /// Send a packet to one broker, then close the link to it.
    async fn unicast_and_close(
        &self,
        to: &BrokerAddress,
        packet: ClusterPacket,
    ) -> ClusterResult<()>;

    /// Send a packet to every connected broker.
    async fn broadcast(&self, packet: ClusterPacket) -> ClusterResult<()>;

    /// Send a packet to every connected broker ahead of queued traffic.
    ///
    /// Returns the brokers actually sent to, with the link each went out on.
    async fn broadcast_urgent(
        &self,
        packet: ClusterPacket,
    ) -> ClusterResult<Vec<(BrokerAddress, LinkId)>>;

    // ========================================================================
    // Link control
    // ========================================================================

    /// Close the link to a broker. A forced close also stops reconnects
    /// until the broker is seen again with a new session.
    async fn close_link(&self, addr: &BrokerAddress, force: bool);

    /// Probe whether a broker answers within `timeout`.
    async fn is_reachable(&self, addr: &BrokerAddress, timeout: Duration) -> ClusterResult<bool>;

    /// True if the link to `addr` is no longer the link identified by `link`.
    fn is_link_modified(&self, addr: &BrokerAddress, link: LinkId) -> bool;
}

/// Persistent log of config change records kept by the master broker.
///
/// Non-master brokers also keep the refresh bookkeeping used to resume
/// config sync after a restart.
#[async_trait]
pub trait ConfigChangeStore: Send + Sync {
    async fn append(&self, record: ChangeRecord) -> ClusterResult<()>;

    /// Records with a timestamp strictly after `since`, or every record.
    async fn records_since(&self, since: Option<i64>) -> ClusterResult<Vec<ChangeRecord>>;

    async fn clear(&self) -> ClusterResult<()>;

    /// Time of the last successful config sync, if any.
    fn last_refresh_time(&self) -> Option<i64>;

    /// Broker id of the config server the last sync ran against.
    fn last_config_server(&self) -> Option<String>;

    /// Remember a completed sync against `config_server`.
    fn set_last_refresh(&self, config_server: &str, timestamp: i64);
}

/// Hooks into the broker that embeds the protocol engine.
///
/// Every hook has a default so embedders implement only what they use.
#[async_trait]
pub trait BrokerCallbacks: Send + Sync {
    /// A peer was admitted into the live broker list.
    async fn activate_broker(&self, _info: &BrokerInfo) -> ClusterResult<()> {
        Ok(())
    }

    /// A peer left the live broker list.
    async fn deactivate_broker(&self, _addr: &BrokerAddress) {}

    /// True if this broker currently serves `store_session`.
    fn owns_store_session(&self, _store_session: u64) -> bool {
        false
    }

    /// Apply a replicated config change locally.
    async fn apply_change_record(&self, _record: &ChangeRecord) -> ClusterResult<()> {
        Ok(())
    }

    /// The cluster's master broker changed.
    fn master_broker_changed(&self, _old: Option<&BrokerAddress>, _new: &BrokerAddress) {}

    /// Process a message acknowledgement sent by a consuming broker.
    async fn handle_message_ack(
        &self,
        _from: &BrokerAddress,
        _packet: &ClusterPacket,
    ) -> (Status, Option<String>) {
        (Status::Ok, None)
    }

    /// This broker's store session is being taken over by another broker.
    ///
    /// Implementations must stop serving and restart the process.
    fn restart_broker(&self, reason: &str) {
        tracing::error!(reason, "Broker restart requested but no handler is installed");
    }
}
