//! Master broker migration.
//!
//! Run on the current master broker:
//!
//! 1. Block config change events and drain in-flight ones
//! 2. NEW_MASTER_BROKER_PREPARE ships a compacted change log to the candidate
//! 3. NEW_MASTER_BROKER commits the candidate
//! 4. NEW_MASTER_BROKER tells every other broker
//!
//! The block is released when the migration returns, on every path.

use std::collections::HashMap;

use futures::future::join_all;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ConfigServer, PreparedMigration, ProtocolEngine};
use crate::cluster::address::BrokerAddress;
use crate::cluster::change_record::{ChangeRecord, compress, decode_records, encode_records};
use crate::cluster::error::{ClusterError, ClusterResult};
use crate::cluster::metrics;
use crate::cluster::packet::{ClusterPacket, PacketType};
use crate::cluster::reply::ReplyWaiter;
use crate::cluster::status::Status;
use crate::constants::{
    MIN_MASTER_MIGRATION_VERSION, PROP_NEW_MASTER, PROP_OLD_MASTER, PROP_RECORD_COUNT, PROP_UUID,
    PROP_XID, SYNC_FROM_START,
};

impl ProtocolEngine {
    /// Move the master broker role to `new_master_id`.
    ///
    /// Must run on the current master broker of a non-HA cluster. When
    /// `old_master_id` is given it must name the current master.
    /// Migrating to the current master is a no-op.
    pub async fn change_master_broker(
        &self,
        new_master_id: &str,
        old_master_id: Option<&str>,
    ) -> ClusterResult<()> {
        let result = self.migrate_master(new_master_id, old_master_id).await;
        let label = match &result {
            Ok(()) => "ok",
            Err(e) => e.status().as_metric_label(),
        };
        metrics::record_master_migration(label);
        match &result {
            Ok(()) => info!(new_master = new_master_id, "Master broker migration finished"),
            Err(e) => warn!(new_master = new_master_id, error = %e, "Master broker migration failed"),
        }
        result
    }

    async fn migrate_master(
        &self,
        new_master_id: &str,
        old_master_id: Option<&str>,
    ) -> ClusterResult<()> {
        if new_master_id.is_empty() {
            return Err(ClusterError::InvalidArgument(
                "new master broker not specified".into(),
            ));
        }
        if self.config.ha_enabled {
            return Err(ClusterError::Precondition(
                "master broker migration is not supported in HA mode".into(),
            ));
        }
        let Some(master_id) = self.master_broker_id() else {
            return Err(ClusterError::Precondition("no master broker configured".into()));
        };
        if let Some(old) = old_master_id
            && old != master_id
        {
            return Err(ClusterError::Precondition(format!(
                "old master broker {} is not the current master broker {}",
                old, master_id
            )));
        }
        if new_master_id == master_id {
            info!(master = %master_id, "Broker is already the master broker");
            return Ok(());
        }
        if master_id != self.self_addr.broker_id {
            return Err(ClusterError::NotMaster { master: master_id });
        }
        if !self.is_config_sync_complete() {
            return Err(ClusterError::ConfigSyncIncomplete(master_id));
        }
        let candidate = self.brokers.get_by_id(new_master_id).ok_or_else(|| {
            ClusterError::Precondition(format!("broker {} is not connected", new_master_id))
        })?;
        let new_master = candidate.address().clone();
        let required = MIN_MASTER_MIGRATION_VERSION.max(self.config.protocol_version);
        match candidate.info().protocol_version {
            Some(v) if v >= required => {}
            version => {
                return Err(ClusterError::Precondition(format!(
                    "broker {} protocol version {:?} below {}",
                    new_master, version, required
                )));
            }
        }

        let _block = self
            .migration_block
            .block_wait(self.config.wait_reply_timeout, self.config.max_reply_wait_interval)
            .await
            .map_err(|e| ClusterError::Precondition(e.to_string()))?;

        let uuid = Uuid::new_v4().to_string();
        info!(new_master = %new_master, %uuid, "Starting master broker migration");

        self.send_prepare(&new_master, &uuid).await?;

        let old_master = self.self_addr.clone();
        self.set_config_server(ConfigServer::Resolved(new_master.clone()));
        self.callbacks
            .master_broker_changed(Some(&old_master), &new_master);

        let commit = ClusterPacket::new(PacketType::NewMasterBroker)
            .with(PROP_NEW_MASTER, new_master.broker_id.as_str())
            .with(PROP_OLD_MASTER, old_master.broker_id.as_str())
            .with(PROP_UUID, uuid.as_str());
        let committed = self
            .send_and_wait(
                &self.new_master_tracker,
                &new_master,
                commit.clone(),
                ReplyWaiter::unicast(new_master.clone(), PacketType::NewMasterBrokerReply),
                self.config.wait_reply_timeout,
            )
            .await;
        if let Err(e) = committed {
            warn!(new_master = %new_master, error = %e, "New master broker did not commit, restoring");
            self.set_config_server(ConfigServer::Resolved(old_master.clone()));
            self.callbacks
                .master_broker_changed(Some(&new_master), &old_master);
            return Err(link_down(e));
        }

        self.store.set_last_refresh(&new_master.broker_id, SYNC_FROM_START);
        self.notify_new_master(&new_master, commit).await
    }

    async fn send_prepare(&self, new_master: &BrokerAddress, uuid: &str) -> ClusterResult<()> {
        let mut records = vec![ChangeRecord {
            uuid: Some(uuid.to_string()),
            ..ChangeRecord::reset()
        }];
        records.extend(compress(&self.store.records_since(None).await?));

        let prepare = ClusterPacket::new(PacketType::NewMasterBrokerPrepare)
            .with(PROP_RECORD_COUNT, records.len() as i32)
            .with(PROP_UUID, uuid)
            .with_payload(encode_records(&records)?);
        self.send_and_wait(
            &self.new_master_tracker,
            new_master,
            prepare,
            ReplyWaiter::unicast(new_master.clone(), PacketType::NewMasterBrokerPrepareReply),
            self.config.wait_reply_timeout,
        )
        .await
        .map(|_| ())
        .map_err(link_down)
    }

    /// Tell every broker other than `new_master` about the new master:
    /// every packet goes out before the first reply is awaited.
    async fn notify_new_master(
        &self,
        new_master: &BrokerAddress,
        commit: ClusterPacket,
    ) -> ClusterResult<()> {
        let tracker = &self.new_master_tracker;
        let mut pending = Vec::new();
        let mut failures: HashMap<BrokerAddress, ClusterError> = HashMap::new();

        for broker in self.brokers.addresses(Some(new_master)) {
            let xid = tracker.add_waiter(ReplyWaiter::unicast(
                broker.clone(),
                PacketType::NewMasterBrokerReply,
            ));
            let mut packet = commit.clone().with(PROP_XID, xid);
            packet.reply_requested = true;
            match self.transport.unicast(&broker, packet).await {
                Ok(()) => pending.push((broker, xid)),
                Err(e) => {
                    tracker.remove_waiter(xid);
                    failures.insert(broker, e);
                }
            }
        }

        let timeout = self.config.wait_reply_timeout;
        let replies = join_all(pending.into_iter().map(|(broker, xid)| async move {
            let result = match tracker.wait_for_reply(xid, timeout).await {
                Ok(Some(reply)) if reply.status().is_ok() => Ok(()),
                Ok(Some(reply)) => Err(ClusterError::reply(
                    PacketType::NewMasterBrokerReply,
                    reply.status(),
                    reply.reason().to_string(),
                )),
                Ok(None) => Err(ClusterError::reply(
                    PacketType::NewMasterBrokerReply,
                    Status::Error,
                    "request aborted",
                )),
                Err(e) => Err(link_down(e)),
            };
            (broker, result)
        }))
        .await;
        for (broker, result) in replies {
            if let Err(e) = result {
                failures.insert(broker, e);
            }
        }

        let Some(first) = failures.values().next() else {
            return Ok(());
        };
        let status = first.status();
        let brokers = failures
            .iter()
            .map(|(b, e)| format!("{} ({})", b, e))
            .collect::<Vec<_>>()
            .join(", ");
        Err(ClusterError::reply(
            PacketType::NewMasterBrokerReply,
            status,
            format!("brokers not notified of new master broker: {}", brokers),
        ))
    }
}

/// A migration peer that went away reads as a link failure.
fn link_down(e: ClusterError) -> ClusterError {
    match e {
        ClusterError::Reply {
            packet,
            status: Status::Gone,
            ..
        } => ClusterError::reply(packet, Status::Gone, "link down"),
        other => other,
    }
}

/// Candidate side of NEW_MASTER_BROKER_PREPARE: replace the local change log
/// with the shipped one.
pub(super) async fn handle_prepare(
    engine: &ProtocolEngine,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    if engine.master_broker().as_ref() != Some(sender) {
        return Err(ClusterError::Precondition(format!(
            "prepare from {} which is not the master broker",
            sender
        )));
    }
    if !engine.is_config_sync_complete() {
        return Err(ClusterError::ConfigSyncIncomplete(sender.broker_id.clone()));
    }
    let uuid = packet.get_str(PROP_UUID)?.to_string();
    let payload = packet
        .payload
        .as_ref()
        .ok_or_else(|| ClusterError::Protocol("prepare without change records".into()))?;
    let mut records = decode_records(payload)?.into_iter();
    if !records.next().is_some_and(|r| r.is_reset()) {
        return Err(ClusterError::Protocol(
            "prepare change records do not start with a reset".into(),
        ));
    }

    engine.store.clear().await?;
    let mut last = 0;
    for record in records {
        last = last.max(record.timestamp);
        if let Err(e) = engine.store.append(record).await {
            if let Err(clear) = engine.store.clear().await {
                warn!(error = %clear, "Failed to clear change records after failed prepare");
            }
            return Err(e);
        }
    }
    engine
        .last_record_timestamp
        .fetch_max(last, std::sync::atomic::Ordering::SeqCst);

    info!(from = %sender, %uuid, "Prepared master broker migration");
    *engine
        .prepared_migration
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(PreparedMigration {
        uuid,
        from: sender.clone(),
    });
    Ok(Some(ClusterPacket::reply_to(
        packet,
        PacketType::NewMasterBrokerPrepareReply,
        Status::Ok,
        None,
    )))
}

/// NEW_MASTER_BROKER: switch to the new master broker.
pub(super) async fn handle_new_master_broker(
    engine: &ProtocolEngine,
    sender: &BrokerAddress,
    packet: &ClusterPacket,
) -> ClusterResult<Option<ClusterPacket>> {
    let new_master = packet.get_str(PROP_NEW_MASTER)?;
    let uuid = packet.get_str_opt(PROP_UUID);
    let ok = ClusterPacket::reply_to(packet, PacketType::NewMasterBrokerReply, Status::Ok, None);

    if !engine.is_config_server(sender) && sender.broker_id != new_master {
        return Err(ClusterError::Precondition(format!(
            "new master broker {} announced by {} which is neither master broker",
            new_master, sender
        )));
    }
    if engine.master_broker_id().as_deref() == Some(new_master) {
        return Ok(Some(ok));
    }

    let is_self = new_master == engine.self_addr.broker_id;
    if is_self {
        let prepared = engine
            .prepared_migration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match prepared {
            Some(p) if Some(p.uuid.as_str()) == uuid => {
                info!(from = %p.from, uuid = %p.uuid, "Committing master broker migration");
            }
            _ => {
                return Err(ClusterError::Precondition(format!(
                    "master broker migration {:?} was not prepared",
                    uuid
                )));
            }
        }
    }

    if !engine.is_config_sync_complete() {
        if is_self {
            return Err(ClusterError::ConfigSyncIncomplete(
                engine.master_broker_id().unwrap_or_default(),
            ));
        }
        if let Some(server) = engine.master_broker() {
            engine.transport.close_link(&server, true).await;
        }
    }

    let old = engine.master_broker();
    let resolved = if is_self {
        Some(engine.self_addr.clone())
    } else {
        engine
            .brokers
            .get_by_id(new_master)
            .map(|b| b.address().clone())
    };
    match &resolved {
        Some(addr) => {
            engine.set_config_server(ConfigServer::Resolved(addr.clone()));
            engine.callbacks.master_broker_changed(old.as_ref(), addr);
        }
        None => engine.set_config_server(ConfigServer::Unresolved(new_master.to_string())),
    }
    if is_self {
        engine.set_config_sync_complete(true);
    }
    engine.store.set_last_refresh(new_master, SYNC_FROM_START);

    info!(new_master, old = ?old.map(|o| o.to_string()), from = %sender, "Master broker changed");
    Ok(Some(ok))
}
