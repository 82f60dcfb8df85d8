//! Message acknowledgements to the message home broker.

use tracing::{debug, warn};

use super::ProtocolEngine;
use crate::cluster::address::BrokerAddress;
use crate::cluster::error::{ClusterError, ClusterResult};
use crate::cluster::packet::{ClusterPacket, PacketType};
use crate::cluster::reply::ReplyWaiter;

impl ProtocolEngine {
    /// Send a message acknowledgement to the broker that owns the message.
    ///
    /// With `ackack`, waits until `home` confirms it processed the ack.
    /// A home broker that left, said goodbye or is being taken over is
    /// reported as [`ClusterError::BrokerDown`].
    pub async fn send_message_ack(
        &self,
        home: &BrokerAddress,
        mut ack: ClusterPacket,
        ackack: bool,
    ) -> ClusterResult<()> {
        ack.packet_type = PacketType::MessageAck;

        if *home == self.self_addr {
            let (status, reason) = self.callbacks.handle_message_ack(&self.self_addr, &ack).await;
            if ackack && !status.is_ok() {
                return Err(ClusterError::reply(
                    PacketType::MessageAckReply,
                    status,
                    reason.unwrap_or_default(),
                ));
            }
            return Ok(());
        }

        let down = |reason: &str| ClusterError::BrokerDown {
            broker: home.to_string(),
            reason: reason.to_string(),
        };
        let Some(entry) = self.brokers.get(home) else {
            return Err(down("not in live broker list"));
        };
        if entry.sent_or_received_goodbye() {
            return Err(down("goodbyed"));
        }
        if self.is_takeover_target(home).await {
            return Err(down("being taken over"));
        }

        if !ackack {
            return self.transport.unicast(home, ack).await;
        }

        match self
            .send_and_wait(
                &self.ack_tracker,
                home,
                ack,
                ReplyWaiter::message_ack(home.clone()),
                self.config.ack_timeout,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_gone() => Err(down("home gone")),
            Err(e) if e.is_timeout() => {
                warn!(home = %home, error = %e, "No response to message ack");
                Err(down("no response"))
            }
            Err(e) => Err(e),
        }
    }
}

pub(super) async fn handle_message_ack(
    engine: &ProtocolEngine,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    let (status, reason) = engine.callbacks.handle_message_ack(sender, packet).await;
    debug!(from = %sender, %status, "Processed message ack");
    if packet.xid_opt().is_none() {
        return Ok(None);
    }
    Ok(Some(ClusterPacket::reply_to(
        packet,
        PacketType::MessageAckReply,
        status,
        reason.as_deref(),
    )))
}
