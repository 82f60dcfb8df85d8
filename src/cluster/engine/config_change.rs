//! Config change events and config sync.
//!
//! Every destination and durable subscription change is recorded in the
//! master broker's change log before it takes effect. A broker that is not
//! the master broker ships the change with CONFIG_CHANGE_EVENT and waits for
//! the master broker's answer. Brokers replay the log with
//! GET_CONFIG_CHANGES_REQUEST when they connect to the master broker.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::{ConfigServer, ProtocolEngine};
use crate::cluster::address::BrokerAddress;
use crate::cluster::change_record::{
    ChangeEvent, ChangeRecord, compress, decode_records, encode_records,
};
use crate::cluster::error::{ClusterError, ClusterResult};
use crate::cluster::event_log::EventLogStatus;
use crate::cluster::metrics;
use crate::cluster::packet::{ClusterPacket, PacketType};
use crate::cluster::reply::ReplyWaiter;
use crate::cluster::reply_tracker::next_xid;
use crate::cluster::status::Status;
use crate::constants::{
    PROP_REASON, PROP_RECORD_COUNT, PROP_SINCE, PROP_STATUS, PROP_TIMESTAMP, PROP_XID,
    SYNC_FROM_START,
};

impl ProtocolEngine {
    pub async fn record_update_destination(
        &self,
        dest_type: &str,
        name: &str,
        attrs: BTreeMap<String, String>,
    ) -> ClusterResult<()> {
        self.record_config_change_event(ChangeEvent::DestinationUpdate {
            dest_type: dest_type.to_string(),
            name: name.to_string(),
            attrs,
        })
        .await
    }

    pub async fn record_remove_destination(&self, dest_type: &str, name: &str) -> ClusterResult<()> {
        self.record_config_change_event(ChangeEvent::DestinationRemove {
            dest_type: dest_type.to_string(),
            name: name.to_string(),
        })
        .await
    }

    pub async fn record_create_subscription(
        &self,
        client_id: &str,
        name: &str,
        dest: &str,
    ) -> ClusterResult<()> {
        self.record_config_change_event(ChangeEvent::SubscriptionCreate {
            client_id: client_id.to_string(),
            name: name.to_string(),
            dest: dest.to_string(),
        })
        .await
    }

    pub async fn record_unsubscribe(&self, client_id: &str, name: &str) -> ClusterResult<()> {
        self.record_config_change_event(ChangeEvent::Unsubscribe {
            client_id: client_id.to_string(),
            name: name.to_string(),
        })
        .await
    }

    /// Record `event` in the master broker's change log.
    ///
    /// Succeeds without recording anything when no master broker is
    /// configured. Refused while a master broker migration runs.
    pub async fn record_config_change_event(&self, event: ChangeEvent) -> ClusterResult<()> {
        let result = self.record_event(ChangeRecord::new(event)).await;
        let label = match &result {
            Ok(()) => "ok",
            Err(e) => e.status().as_metric_label(),
        };
        metrics::record_config_change_event(label);
        result
    }

    async fn record_event(&self, record: ChangeRecord) -> ClusterResult<()> {
        let _op = self.migration_block.set_config_op_in_progress_if_not_blocked()?;

        let master = match self.config_server() {
            ConfigServer::None => return Ok(()),
            ConfigServer::Unresolved(id) => return Err(ClusterError::MasterNotResolved(id)),
            ConfigServer::Resolved(master) => master,
        };
        if !self.is_config_sync_complete() {
            return Err(ClusterError::ConfigSyncIncomplete(master.broker_id));
        }
        if master == self.self_addr {
            return self.append_stamped(record).await;
        }

        let xid = next_xid();
        let waiter = self.event_log_waiters.register_scoped(xid);
        let packet = ClusterPacket::new(PacketType::ConfigChangeEvent)
            .with(PROP_XID, xid)
            .with_payload(encode_records(std::slice::from_ref(&record))?)
            .with_reply_requested();
        self.transport.unicast(&master, packet).await?;

        let status = waiter
            .wait(self.config.wait_reply_timeout, self.config.max_reply_wait_interval)
            .await;
        drop(waiter);
        match status {
            EventLogStatus::Success => {
                debug!(record = %record, master = %master, "Config change recorded");
                Ok(())
            }
            EventLogStatus::Failure(reason) => Err(ClusterError::reply(
                PacketType::ConfigChangeEventReply,
                Status::Error,
                reason,
            )),
            EventLogStatus::Waiting => Err(ClusterError::reply(
                PacketType::ConfigChangeEventReply,
                Status::Timeout,
                format!("no reply from master broker {}", master),
            )),
        }
    }

    /// Append under a timestamp strictly after every earlier record.
    async fn append_stamped(&self, mut record: ChangeRecord) -> ClusterResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let prev = self
            .last_record_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        record.timestamp = now.max(prev + 1);
        debug!(record = %record, "Appending config change record");
        self.store.append(record).await
    }

    /// Ask `server` for the change records this broker has not seen.
    ///
    /// With `wait`, returns once the records are applied.
    pub(crate) async fn send_config_changes_request(
        &self,
        server: &BrokerAddress,
        wait: bool,
    ) -> ClusterResult<()> {
        let since = match (self.store.last_config_server(), self.store.last_refresh_time()) {
            (Some(last), Some(ts)) if last == server.broker_id => ts,
            _ => SYNC_FROM_START,
        };
        info!(server = %server, since, "Requesting config changes");
        let packet = ClusterPacket::new(PacketType::GetConfigChangesRequest).with(PROP_SINCE, since);

        if wait {
            self.send_and_wait(
                &self.config_sync_tracker,
                server,
                packet,
                ReplyWaiter::unicast(server.clone(), PacketType::GetConfigChangesReply),
                self.config.wait_reply_timeout,
            )
            .await
            .map(|_| ())
        } else {
            self.transport.unicast(server, packet).await
        }
    }

    async fn apply_config_changes(
        &self,
        sender: &BrokerAddress,
        packet: &ClusterPacket,
    ) -> ClusterResult<()> {
        let records = match &packet.payload {
            Some(payload) => decode_records(payload)?,
            None => Vec::new(),
        };
        let refreshed = packet.get_long(PROP_TIMESTAMP)?;
        for record in &records {
            self.callbacks.apply_change_record(record).await?;
        }
        self.store.set_last_refresh(&sender.broker_id, refreshed);
        if self.is_config_server(sender) && !self.is_config_sync_complete() {
            self.set_config_sync_complete(true);
            info!(server = %sender, records = records.len(), "Config sync complete");
        } else {
            debug!(server = %sender, records = records.len(), "Config changes applied");
        }
        Ok(())
    }
}

/// Master broker side of CONFIG_CHANGE_EVENT.
pub(super) async fn handle_config_change_event(
    engine: &ProtocolEngine,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    if engine.master_broker().as_ref() != Some(&engine.self_addr) {
        return Err(ClusterError::NotMaster {
            master: engine.master_broker_id().unwrap_or_default(),
        });
    }
    let _op = engine
        .migration_block
        .set_config_op_in_progress_if_not_blocked()?;

    let payload = packet
        .payload
        .as_ref()
        .ok_or_else(|| ClusterError::Protocol("config change event without record".into()))?;
    for record in decode_records(payload)? {
        debug!(record = %record, from = %sender, "Recording config change event");
        engine.append_stamped(record).await?;
    }
    Ok(Some(ClusterPacket::reply_to(
        packet,
        PacketType::ConfigChangeEventReply,
        Status::Ok,
        None,
    )))
}

pub(super) fn handle_config_change_event_reply(
    engine: &ProtocolEngine,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    let xid = packet.xid()?;
    let status = match packet.status() {
        Status::Ok => EventLogStatus::Success,
        other => EventLogStatus::Failure(format!("{}: {}", other, packet.reason())),
    };
    if !engine.event_log_waiters.resolve(xid, status) {
        warn!(from = %sender, xid, "Config change event reply without waiter");
    }
    Ok(None)
}

/// Master broker side of GET_CONFIG_CHANGES_REQUEST.
///
/// A request from the start gets a reset followed by the compacted log.
pub(super) async fn handle_get_config_changes(
    engine: &ProtocolEngine,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    if engine.master_broker().as_ref() != Some(&engine.self_addr) {
        return Err(ClusterError::NotMaster {
            master: engine.master_broker_id().unwrap_or_default(),
        });
    }
    let since = packet.get_long(PROP_SINCE)?;
    let records = if since < 0 {
        let mut all = vec![ChangeRecord::reset()];
        all.extend(compress(&engine.store.records_since(None).await?));
        all
    } else {
        engine.store.records_since(Some(since)).await?
    };
    let refreshed = records.iter().map(|r| r.timestamp).max().unwrap_or(since).max(since);
    debug!(to = %sender, since, records = records.len(), "Sending config changes");

    let mut reply =
        ClusterPacket::reply_to(packet, PacketType::GetConfigChangesReply, Status::Ok, None)
            .with(PROP_RECORD_COUNT, records.len() as i32)
            .with(PROP_TIMESTAMP, refreshed);
    reply.payload = Some(encode_records(&records)?);
    Ok(Some(reply))
}

/// Apply a GET_CONFIG_CHANGES_REPLY, then wake whoever waits for it.
pub(super) async fn handle_get_config_changes_reply(
    engine: &ProtocolEngine,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    let mut outcome = packet.clone();
    if packet.status().is_ok() {
        if let Err(e) = engine.apply_config_changes(sender, packet).await {
            warn!(from = %sender, error = %e, "Failed to apply config changes");
            outcome.put(PROP_STATUS, Status::Error.code());
            outcome.put(PROP_REASON, e.to_string());
        }
    } else {
        warn!(from = %sender, status = %packet.status(), reason = packet.reason(), "Config changes request refused");
    }

    match packet.xid_opt() {
        Some(xid) if engine.config_sync_tracker.notify_reply(xid, sender, outcome) => {}
        _ => debug!(from = %sender, "Config changes reply without waiter"),
    }
    Ok(None)
}
