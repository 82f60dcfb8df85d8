//! Store session owner lookup.

use tracing::{debug, warn};

use super::ProtocolEngine;
use crate::cluster::address::BrokerAddress;
use crate::cluster::error::ClusterResult;
use crate::cluster::packet::{ClusterPacket, PacketType};
use crate::cluster::reply::ReplyWaiter;
use crate::cluster::status::Status;
use crate::constants::{PROP_OWNER, PROP_QUERY_STORE_SESSION, PROP_XID};

impl ProtocolEngine {
    /// Broker id of the broker currently serving `store_session`.
    ///
    /// Asks every live peer when neither this broker nor a listed peer
    /// serves it. `None` if nobody claims the session in time.
    pub async fn lookup_store_session_owner(&self, store_session: u64) -> Option<String> {
        if self.callbacks.owns_store_session(store_session) {
            return Some(self.self_addr.broker_id.clone());
        }
        if let Some(owner) = self.brokers.get_by_store_session(store_session) {
            return Some(owner.address().broker_id.clone());
        }

        let peers = self.brokers.addresses(None);
        if peers.is_empty() {
            return None;
        }
        let xid = self
            .any_ok_tracker
            .add_waiter(ReplyWaiter::broadcast_any_ok(peers.clone(), PacketType::Info));
        let request = ClusterPacket::new(PacketType::InfoRequest)
            .with(PROP_XID, xid)
            .with(PROP_QUERY_STORE_SESSION, store_session)
            .with_reply_requested();
        for peer in &peers {
            if let Err(e) = self.transport.unicast(peer, request.clone()).await {
                debug!(broker = %peer, error = %e, "Failed to send store session query");
                if let Some(waiter) = self.any_ok_tracker.get_waiter(xid) {
                    waiter.remove_participant(peer, false, false);
                }
            }
        }

        match self
            .any_ok_tracker
            .wait_for_reply(xid, self.config.wait_info_reply_timeout)
            .await
        {
            Ok(reply) => reply.and_then(|r| r.packet().get_str_opt(PROP_OWNER).map(str::to_string)),
            Err(e) => {
                warn!(store_session, error = %e, "Store session owner lookup failed");
                None
            }
        }
    }
}

pub(super) fn handle_info_request(
    engine: &ProtocolEngine,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    let store_session = packet.get_long(PROP_QUERY_STORE_SESSION)? as u64;
    if !engine.callbacks.owns_store_session(store_session) {
        debug!(from = %sender, store_session, "Store session not served here");
        return Ok(Some(ClusterPacket::reply_to(
            packet,
            PacketType::Info,
            Status::NotFound,
            None,
        )));
    }
    Ok(Some(
        ClusterPacket::reply_to(packet, PacketType::Info, Status::Ok, None)
            .with(PROP_OWNER, engine.self_addr.broker_id.as_str())
            .with(PROP_QUERY_STORE_SESSION, store_session),
    ))
}
