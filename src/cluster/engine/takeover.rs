//! Store session takeover.
//!
//! ```text
//!  taker                         every other broker
//!  pre_takeover
//!   ├─ record announcement
//!   ├─ close links to the target ──▶
//!   └─ TAKEOVER_PENDING ───────────▶ record, close links to the target,
//!                                    relay to the rest, then reply
//!      ◀── TAKEOVER_PENDING_REPLY ──
//!  (store session taken over by the caller)
//!  post_takeover
//!   └─ TAKEOVER_COMPLETE / _ABORT ─▶ complete or forget the announcement
//! ```
//!
//! A broker that finds itself the target of an announcement restarts
//! instead of serving a store another broker now owns.

use std::sync::Arc;

use backon::Retryable;
use tracing::{debug, error, info, warn};

use super::ProtocolEngine;
use crate::cluster::address::BrokerAddress;
use crate::cluster::error::{ClusterError, ClusterResult};
use crate::cluster::metrics;
use crate::cluster::packet::{ClusterPacket, PacketType};
use crate::cluster::reply::ReplyWaiter;
use crate::cluster::reply_tracker::next_xid;
use crate::cluster::retry::convergecast_policy;
use crate::cluster::status::Status;
use crate::cluster::takeover::{TakeoverInfo, TakeoverKey, TargetCheck};

impl ProtocolEngine {
    /// Announce that this broker is about to take over `target`'s store
    /// session, and wait until every live broker has fenced the target off.
    ///
    /// `target` is the last known incarnation of the broker being taken
    /// over.
    pub async fn pre_takeover(&self, target: &BrokerAddress) -> ClusterResult<()> {
        if !self.config.ha_enabled {
            return Err(ClusterError::Precondition(
                "store session takeover requires HA mode".to_string(),
            ));
        }
        let key = TakeoverKey::of(target);
        let xid = next_xid();
        let info = TakeoverInfo::pending(
            key.clone(),
            target.host.clone(),
            target.broker_session,
            xid,
        );
        info!(takeover = %info, "Starting takeover");
        metrics::record_takeover_event("pending");

        self.takeovers.add(&info);
        self.lock_pretakeovers().insert(key.clone(), xid);
        self.takeover_cleanup(&key, false).await;

        (|| self.convergecast(None, &info))
            .retry(convergecast_policy())
            .when(ClusterError::is_gone)
            .notify(|e, delay| {
                warn!(takeover = %info, error = %e, ?delay, "Takeover convergecast failed, retrying");
            })
            .await
            .inspect_err(|e| {
                warn!(takeover = %info, error = %e, "Takeover convergecast failed");
            })?;

        self.takeovers.pre_takeover_done(&key, xid);
        info!(takeover = %info, "Takeover pending acknowledged by all brokers");
        Ok(())
    }

    /// Finish a takeover started by [`pre_takeover`](Self::pre_takeover).
    ///
    /// An aborted takeover is withdrawn cluster-wide. A successful one is
    /// marked complete, and announced when `notify` is set.
    pub async fn post_takeover(
        self: &Arc<Self>,
        target: &TakeoverKey,
        aborted: bool,
        notify: bool,
    ) -> ClusterResult<()> {
        let xid = self.lock_pretakeovers().remove(target);

        if aborted {
            let Some(xid) = xid else {
                warn!(target = %target, "No pre-takeover recorded, nothing to abort");
                return Ok(());
            };
            let info = TakeoverInfo::notice(target.clone(), Some(xid));
            info!(takeover = %info, "Aborting takeover");
            metrics::record_takeover_event("abort");
            self.received_takeover_abort(&info);
            return self
                .transport
                .broadcast(info.to_packet(PacketType::TakeoverAbort))
                .await;
        }

        metrics::record_takeover_event("complete");
        if !notify {
            self.takeovers.complete(target);
            return Ok(());
        }
        info!(target = %target, "Takeover complete");
        self.received_takeover_complete(target);
        self.transport
            .broadcast(TakeoverInfo::notice(target.clone(), xid).to_packet(PacketType::TakeoverComplete))
            .await
    }

    /// True if `addr` is the target of a takeover this broker knows of.
    pub async fn is_takeover_target(&self, addr: &BrokerAddress) -> bool {
        match self.takeovers.check_target(addr) {
            TargetCheck::NotTarget => false,
            TargetCheck::Target => true,
            TargetCheck::UnlessOwner => self
                .lookup_store_session_owner(addr.store_session)
                .await
                .is_some_and(|owner| owner != addr.broker_id),
        }
    }

    /// Fence the target of `key` off: restart if it is this broker,
    /// otherwise force-close every link to it and wait for deactivation.
    async fn takeover_cleanup(&self, key: &TakeoverKey, complete: bool) {
        if self.takeovers.check_target(&self.self_addr) == TargetCheck::Target {
            let reason = format!("store session {} is being taken over", key);
            error!(broker = %self.self_addr, complete, "{}", reason);
            metrics::record_takeover_event("self_restart");
            self.callbacks.restart_broker(&reason);
            return;
        }

        let poll = self.config.link_deactivate_poll_interval;
        for broker in self.brokers.snapshot() {
            let addr = broker.address().clone();
            if TakeoverKey::of(&addr) != *key || !self.is_takeover_target(&addr).await {
                continue;
            }
            info!(broker = %addr, takeover = %key, "Closing link to takeover target");
            self.transport.close_link(&addr, true).await;

            let mut waited = std::time::Duration::ZERO;
            while !broker.wait_deactivated(poll).await {
                waited += poll;
                if self.is_shutdown() {
                    return;
                }
                if waited >= self.config.link_init_wait {
                    warn!(broker = %addr, ?waited, "Takeover target link still active");
                    break;
                }
                self.transport.close_link(&addr, true).await;
            }
        }
    }

    /// TAKEOVER_PENDING to every broker except `sender`, waited on as a
    /// convergecast.
    async fn convergecast(
        &self,
        sender: Option<&BrokerAddress>,
        info: &TakeoverInfo,
    ) -> ClusterResult<()> {
        let xid = info
            .xid
            .ok_or_else(|| ClusterError::Protocol("takeover pending without xid".into()))?;
        let peers = self.brokers.addresses(sender);
        if peers.is_empty() {
            return Ok(());
        }

        let waiter = Arc::new(ReplyWaiter::takeover_pending(peers.clone()));
        if !self
            .takeover_pending_tracker
            .add_waiter_with_xid(xid, waiter.clone())
        {
            return Err(ClusterError::Protocol(format!(
                "takeover convergecast {} already running",
                xid
            )));
        }

        let packet = match sender {
            None => info.to_packet(PacketType::TakeoverPending),
            Some(_) => info.relayed().to_packet(PacketType::TakeoverPending),
        };
        for peer in &peers {
            if let Err(e) = self.transport.unicast(peer, packet.clone()).await {
                warn!(broker = %peer, error = %e, "Failed to send takeover pending");
                waiter.remove_participant(peer, false, false);
            }
        }

        self.takeover_pending_tracker
            .wait_for_reply(xid, self.config.takeover_pending_timeout)
            .await
            .map(|_| ())
    }

    fn received_takeover_complete(self: &Arc<Self>, key: &TakeoverKey) {
        if self.takeovers.complete(key) {
            let engine = self.clone();
            let key = key.clone();
            tokio::spawn(async move { engine.takeover_cleanup(&key, true).await });
        }
    }

    fn received_takeover_abort(&self, info: &TakeoverInfo) {
        self.takeovers.abort(info);
        if let Some(xid) = info.xid {
            self.takeover_pending_tracker.abort_waiter(xid);
        }
    }

    /// Tell a joining broker about known takeovers.
    ///
    /// With `all`, every announcement is replayed to `addr`. Otherwise only
    /// the announcement targeting `addr` is sent, and the link is closed.
    pub(crate) async fn forward_takeover_brokers(&self, addr: &BrokerAddress, all: bool) {
        if !self.config.ha_enabled {
            return;
        }
        if all {
            for packet in self.takeovers.notification_packets() {
                if let Err(e) = self.transport.unicast(addr, packet).await {
                    warn!(broker = %addr, error = %e, "Failed to forward takeover notification");
                }
            }
        } else if let Some(packet) = self.takeovers.notification_packet_for(addr) {
            if let Err(e) = self.transport.unicast_and_close(addr, packet).await {
                warn!(broker = %addr, error = %e, "Failed to notify takeover target");
            }
        }
    }
}

/// Record a takeover announcement, fence its target off, and relay it when
/// it came straight from the taker.
pub(super) fn handle_takeover_pending(
    engine: &Arc<ProtocolEngine>,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    let info = TakeoverInfo::from_packet(packet)?;
    let ok_reply = || {
        info.need_reply
            .then(|| ClusterPacket::reply_to(packet, PacketType::TakeoverPendingReply, Status::Ok, None))
    };

    if !engine.takeovers.add(&info) {
        debug!(takeover = %info, from = %sender, "Duplicate takeover pending");
        return Ok(ok_reply());
    }
    info!(takeover = %info, from = %sender, "Received takeover pending");

    let mut converge = info.from_taker;
    let mut immediate = None;
    if engine.brokers.addresses(Some(sender)).is_empty() {
        converge = false;
        immediate = ok_reply();
    }
    let reply_later = info.need_reply && immediate.is_none();

    let engine = engine.clone();
    let sender = sender.clone();
    let request = packet.clone();
    tokio::spawn(async move {
        engine.takeover_cleanup(&info.key, false).await;
        let result = if converge {
            engine.convergecast(Some(&sender), &info).await
        } else {
            Ok(())
        };
        if let Some(xid) = info.xid {
            engine.takeovers.pre_takeover_done(&info.key, xid);
        }
        if reply_later {
            let reply = match &result {
                Ok(()) => {
                    ClusterPacket::reply_to(&request, PacketType::TakeoverPendingReply, Status::Ok, None)
                }
                Err(e) => {
                    let reason = e.to_string();
                    ClusterPacket::reply_to(
                        &request,
                        PacketType::TakeoverPendingReply,
                        e.status(),
                        Some(&reason),
                    )
                }
            };
            engine.send_reply(&sender, reply).await;
        }
    });

    Ok(immediate)
}

pub(super) fn handle_takeover_complete(
    engine: &Arc<ProtocolEngine>,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    let info = TakeoverInfo::from_packet(packet)?;
    info!(takeover = %info.key, from = %sender, "Received takeover complete");
    engine.received_takeover_complete(&info.key);
    Ok(None)
}

pub(super) fn handle_takeover_abort(
    engine: &Arc<ProtocolEngine>,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    let info = TakeoverInfo::from_packet(packet)?;
    info!(takeover = %info, from = %sender, "Received takeover abort");
    engine.received_takeover_abort(&info);
    Ok(None)
}
