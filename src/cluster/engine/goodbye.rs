//! GOODBYE: announced departure.
//!
//! A broker shutting down tells its peers first, so waiters on it resolve
//! as gone instead of timing out.

use tracing::{debug, info, warn};

use super::ProtocolEngine;
use crate::cluster::address::BrokerAddress;
use crate::cluster::error::ClusterResult;
use crate::cluster::packet::{ClusterPacket, PacketType};
use crate::cluster::status::Status;

impl ProtocolEngine {
    /// Announce this broker's departure to every peer.
    pub async fn send_goodbye(&self) -> ClusterResult<()> {
        for broker in self.brokers.snapshot() {
            broker.set_goodbye_sent();
        }
        info!(broker = %self.self_addr, "Sending goodbye");
        self.transport
            .broadcast(ClusterPacket::new(PacketType::Goodbye).with_reply_requested())
            .await
    }
}

pub(super) async fn handle_goodbye(
    engine: &ProtocolEngine,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    let entry = engine.brokers.get(sender);
    match &entry {
        Some(entry) => entry.set_goodbye_received(),
        None => debug!(from = %sender, "Goodbye from unknown broker"),
    }
    info!(from = %sender, "Received goodbye");

    let reply = ClusterPacket::reply_to(packet, PacketType::GoodbyeReply, Status::Ok, None);
    match engine.transport.unicast(sender, reply).await {
        Ok(()) => {
            if let Some(entry) = entry {
                entry.set_goodbye_reply_sent();
            }
        }
        Err(e) => warn!(to = %sender, error = %e, "Failed to send goodbye reply"),
    }
    Ok(None)
}

pub(super) fn handle_goodbye_reply(
    engine: &ProtocolEngine,
    sender: &BrokerAddress,
) -> ClusterResult<Option<ClusterPacket>> {
    if let Some(entry) = engine.brokers.get(sender) {
        entry.set_goodbye_reply_received();
    }
    debug!(from = %sender, "Received goodbye reply");
    Ok(None)
}
