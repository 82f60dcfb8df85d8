//! Resource election.
//!
//! `lock_resource` broadcasts LOCK with the resource's creation timestamp
//! and collects every live broker's vote:
//!
//! | Receiver state                          | Vote      |
//! |-----------------------------------------|-----------|
//! | unknown resource, or both sides shared  | SUCCESS   |
//! | resource already locked                 | FAILURE   |
//! | electing with a newer timestamp         | SUCCESS (own election fails) |
//! | electing with an older timestamp        | FAILURE   |
//! | electing with the same timestamp        | BACKOFF   |
//!
//! BACKOFF is retried after a random exponential delay up to
//! `lock_max_attempts` times, then reported as FAILURE.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::ProtocolEngine;
use crate::cluster::address::BrokerAddress;
use crate::cluster::error::ClusterResult;
use crate::cluster::metrics;
use crate::cluster::packet::{ClusterPacket, PacketType};
use crate::cluster::reply_tracker::next_xid;
use crate::cluster::resource::{LockState, Resource, ResourceEntry};
use crate::cluster::retry::ElectionBackoff;
use crate::cluster::status::LockStatus;
use crate::constants::{
    DESTINATION_EXCLUSIVE_LOCK_PREFIX, PROP_RESOURCE, PROP_SHARED, PROP_STATUS, PROP_TIMESTAMP,
    PROP_XID,
};

impl ProtocolEngine {
    /// Elect this broker as the exclusive owner of `name`.
    ///
    /// `timestamp` is the resource creation time used as the tie-breaker;
    /// zero means now. Returns SUCCESS, FAILURE or TIMEOUT.
    pub async fn lock_resource(&self, name: &str, timestamp: i64, owner: &str) -> LockStatus {
        self.lock_resource_with(name, timestamp, owner, false).await
    }

    /// Like [`lock_resource`](Self::lock_resource), but succeeds without an
    /// election when a shared lock on `name` is already held.
    pub async fn lock_shared_resource(&self, name: &str, owner: &str) -> LockStatus {
        self.lock_resource_with(name, 0, owner, true).await
    }

    /// Drop a held lock or abandon a running election. Never involves
    /// remote brokers.
    pub fn unlock_resource(&self, name: &str) {
        if let Some(resource) = self.resources.remove(name) {
            debug!(resource = %resource, "Unlocked resource");
            resource.implied_failure();
        }
    }

    async fn lock_resource_with(
        &self,
        name: &str,
        timestamp: i64,
        owner: &str,
        shared: bool,
    ) -> LockStatus {
        let timestamp = if timestamp == 0 {
            chrono::Utc::now().timestamp_millis()
        } else {
            timestamp
        };
        let mut backoff =
            ElectionBackoff::new(self.config.lock_backoff_unit, self.config.lock_max_attempts);
        let mut attempts = 0u32;

        let status = loop {
            attempts += 1;
            let status = self.try_lock(name, timestamp, owner, shared).await;
            if status != LockStatus::Backoff {
                break status;
            }
            match backoff.next() {
                Some(delay) => {
                    debug!(resource = name, attempts, ?delay, "Lock contended, backing off");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(resource = name, attempts, "Lock still contended, giving up");
                    break LockStatus::Failure;
                }
            }
        };

        metrics::record_lock_election(status.as_metric_label(), attempts);
        debug!(resource = name, owner, %status, attempts, "Lock election finished");
        status
    }

    /// One election. Restarts its round while membership keeps changing.
    async fn try_lock(&self, name: &str, timestamp: i64, owner: &str, shared: bool) -> LockStatus {
        let resource = match self
            .resources
            .insert_if_absent(Resource::new(name, owner, shared, timestamp))
        {
            ResourceEntry::Existing(existing) => {
                return if shared && existing.is_shared() {
                    LockStatus::Success
                } else {
                    LockStatus::Failure
                };
            }
            ResourceEntry::Created(resource) => resource,
        };

        let fail_on_timeout = name.starts_with(DESTINATION_EXCLUSIVE_LOCK_PREFIX);
        loop {
            // Peers the request did reach still vote, and the rest are
            // settled by the reachability check at the deadline.
            if let Err(e) = self.send_lock_request(&resource).await {
                warn!(resource = name, error = %e, "Failed to broadcast lock request");
            }
            let status = resource
                .wait_for_status_change(
                    self.config.lock_timeout,
                    self.config.max_reply_wait_interval,
                    fail_on_timeout,
                    self.transport.as_ref(),
                )
                .await;

            match status {
                LockStatus::Success => {
                    resource.set_lock_state(LockState::Locked);
                    return status;
                }
                LockStatus::TryAgain => {
                    info!(resource = %resource, "Broker membership changed, restarting election");
                }
                LockStatus::Failure | LockStatus::Backoff | LockStatus::Timeout => {
                    self.resources.remove_if_same(&resource);
                    return status;
                }
            }
        }
    }

    async fn send_lock_request(&self, resource: &Arc<Resource>) -> ClusterResult<()> {
        let xid = next_xid();
        resource.prepare_lock_request(&self.brokers.addresses(None), xid);

        let mut packet = ClusterPacket::new(PacketType::Lock)
            .with(PROP_RESOURCE, resource.name())
            .with(PROP_TIMESTAMP, resource.timestamp())
            .with(PROP_XID, xid)
            .with(PROP_SHARED, resource.is_shared())
            .with_reply_requested();
        packet.broadcast = true;

        let sent = self.transport.broadcast_urgent(packet).await?;
        resource.update_recipients(&sent);
        Ok(())
    }

    /// A peer joined: every running election restarts its round so the
    /// newcomer gets a vote.
    pub(crate) fn restart_elections(&self, broker: &BrokerAddress) {
        for resource in self.resources.snapshot() {
            if resource.lock_state() == LockState::Locking {
                resource.broker_added(broker);
            }
        }
    }
}

/// Vote on a peer's LOCK. Never blocks.
pub(super) async fn handle_lock(
    engine: &ProtocolEngine,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    let name = packet.get_str(PROP_RESOURCE)?;
    let timestamp = packet.get_long(PROP_TIMESTAMP)?;
    let xid = packet.xid()?;
    let shared = packet.flag(PROP_SHARED);

    let vote = match engine.resources.get(name) {
        None => LockStatus::Success,
        Some(res) if shared && res.is_shared() => LockStatus::Success,
        Some(res) if res.lock_state() == LockState::Locked => LockStatus::Failure,
        Some(res) if timestamp < res.timestamp() => {
            debug!(resource = %res, from = %sender, "Older competing election wins");
            res.implied_failure();
            LockStatus::Success
        }
        Some(res) if timestamp > res.timestamp() => LockStatus::Failure,
        Some(_) => LockStatus::Backoff,
    };
    debug!(resource = name, from = %sender, %vote, "Voting on lock request");

    let reply = ClusterPacket::new(PacketType::LockReply)
        .with(PROP_RESOURCE, name)
        .with(PROP_XID, xid)
        .with(PROP_STATUS, vote.code());
    engine.transport.unicast_urgent(sender, reply).await?;
    Ok(None)
}

pub(super) fn handle_lock_reply(
    engine: &ProtocolEngine,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    let name = packet.get_str(PROP_RESOURCE)?;
    let xid = packet.xid()?;
    let vote = LockStatus::from_code(packet.get_int(PROP_STATUS)?).unwrap_or(LockStatus::Failure);

    match engine.resources.get(name) {
        Some(resource) => resource.consume_response(xid, sender, vote),
        None => debug!(resource = name, from = %sender, %vote, "Vote for unknown resource ignored"),
    }
    Ok(None)
}
