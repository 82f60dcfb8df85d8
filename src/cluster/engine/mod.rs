//! The cluster protocol engine.
//!
//! [`ProtocolEngine`] owns every piece of cross-broker state of one broker
//! and runs the coordination protocols on top of a [`Transport`]:
//!
//! | Protocol | Module | Waiter |
//! |----------|--------|--------|
//! | Resource election | `lock` | per-resource status |
//! | Store session takeover | `takeover` | `TakeoverPending` convergecast |
//! | Master broker migration | `master` | `Unicast` |
//! | Config change events and sync | `config_change` | event log / `Unicast` |
//! | Message acknowledgement | `ack` | `MessageAck` |
//! | Store session owner lookup | `info` | `BroadcastAnyOk` |
//! | Membership and goodbye | `membership`, `goodbye` | |
//!
//! # Locking
//!
//! The broker list, the resource table, the takeover cache and each reply
//! tracker are guarded independently. No lock is held across an `.await`:
//! operations register their waiter, release the table and then wait.
//!
//! # Inbound packets
//!
//! The transport calls [`ProtocolEngine::handle_packet`] for every packet,
//! each on its own task. A handler that fails on a packet that expects a
//! reply answers with the matching reply type and the error's status, so
//! the sender's waiter always resolves.

mod ack;
mod config_change;
mod goodbye;
mod info;
mod lock;
mod master;
mod membership;
mod takeover;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::address::BrokerAddress;
use super::config::ClusterConfig;
use super::error::{ClusterError, ClusterResult};
use super::event_log::EventLogWaiters;
use super::master::MigrationBlock;
use super::membership::BrokerList;
use super::metrics;
use super::packet::{ClusterPacket, PacketType};
use super::reply::{ReplyStatus, ReplyWaiter};
use super::reply_tracker::{ReplyTracker, log_unmatched_reply};
use super::resource::{LockState, ResourceTable};
use super::status::Status;
use super::takeover::{TakeoverCache, TakeoverKey, TakingoverEntry};
use super::transport::{BrokerCallbacks, ConfigChangeStore, Transport};
use crate::constants::PROP_XID;

/// What this broker knows about the config server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConfigServer {
    /// No master broker is configured.
    None,
    /// Configured by id but not connected yet.
    Unresolved(String),
    Resolved(BrokerAddress),
}

impl ConfigServer {
    fn broker_id(&self) -> Option<&str> {
        match self {
            ConfigServer::None => None,
            ConfigServer::Unresolved(id) => Some(id),
            ConfigServer::Resolved(addr) => Some(&addr.broker_id),
        }
    }
}

/// A prepared master migration, remembered by the candidate.
#[derive(Debug, Clone)]
pub(crate) struct PreparedMigration {
    uuid: String,
    from: BrokerAddress,
}

/// Cluster coordination for one broker.
pub struct ProtocolEngine {
    config: ClusterConfig,
    self_addr: BrokerAddress,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ConfigChangeStore>,
    callbacks: Arc<dyn BrokerCallbacks>,

    brokers: BrokerList,
    resources: ResourceTable,
    takeovers: TakeoverCache,
    /// Takeovers this broker announced, by target, with their xid.
    my_pretakeovers: Mutex<HashMap<TakeoverKey, u64>>,

    ack_tracker: ReplyTracker,
    takeover_pending_tracker: ReplyTracker,
    new_master_tracker: ReplyTracker,
    any_ok_tracker: ReplyTracker,
    config_sync_tracker: ReplyTracker,
    event_log_waiters: EventLogWaiters,

    migration_block: MigrationBlock,
    config_server: Mutex<ConfigServer>,
    config_sync_complete: AtomicBool,
    prepared_migration: Mutex<Option<PreparedMigration>>,
    last_record_timestamp: AtomicI64,

    shutdown: AtomicBool,
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("self_addr", &self.self_addr)
            .field("brokers", &self.brokers.len())
            .field("resources", &self.resources.len())
            .field("takeovers", &self.takeovers.len())
            .field("config_server", &self.config_server())
            .finish()
    }
}

impl ProtocolEngine {
    pub fn new(
        config: ClusterConfig,
        self_addr: BrokerAddress,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ConfigChangeStore>,
        callbacks: Arc<dyn BrokerCallbacks>,
    ) -> Arc<Self> {
        let (config_server, sync_complete) = match &config.master_broker {
            None => (ConfigServer::None, true),
            Some(id) if *id == self_addr.broker_id => {
                (ConfigServer::Resolved(self_addr.clone()), true)
            }
            Some(id) => (ConfigServer::Unresolved(id.clone()), false),
        };
        let interval = config.max_reply_wait_interval;

        info!(
            broker = %self_addr,
            ha = config.ha_enabled,
            master = ?config.master_broker,
            "Cluster protocol engine created"
        );

        Arc::new(Self {
            takeovers: TakeoverCache::new(config.takeover_pending_timeout),
            ack_tracker: ReplyTracker::with_max_wait_interval("ack", interval),
            takeover_pending_tracker: ReplyTracker::with_max_wait_interval(
                "takeover_pending",
                interval,
            ),
            new_master_tracker: ReplyTracker::with_max_wait_interval("new_master", interval),
            any_ok_tracker: ReplyTracker::with_max_wait_interval("any_ok", interval),
            config_sync_tracker: ReplyTracker::with_max_wait_interval("config_sync", interval),
            config,
            self_addr,
            transport,
            store,
            callbacks,
            brokers: BrokerList::new(),
            resources: ResourceTable::new(),
            my_pretakeovers: Mutex::new(HashMap::new()),
            event_log_waiters: EventLogWaiters::new(),
            migration_block: MigrationBlock::new(),
            config_server: Mutex::new(config_server),
            config_sync_complete: AtomicBool::new(sync_complete),
            prepared_migration: Mutex::new(None),
            last_record_timestamp: AtomicI64::new(0),
            shutdown: AtomicBool::new(false),
        })
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn self_address(&self) -> &BrokerAddress {
        &self.self_addr
    }

    /// Live peers, excluding this broker.
    pub fn broker_list(&self) -> Vec<BrokerAddress> {
        self.brokers.addresses(None)
    }

    pub fn is_config_sync_complete(&self) -> bool {
        self.config_sync_complete.load(Ordering::SeqCst)
    }

    /// The resolved master broker, if any.
    pub fn master_broker(&self) -> Option<BrokerAddress> {
        match self.config_server() {
            ConfigServer::Resolved(addr) => Some(addr),
            _ => None,
        }
    }

    /// Broker id of the master broker, resolved or not.
    pub fn master_broker_id(&self) -> Option<String> {
        self.config_server().broker_id().map(str::to_string)
    }

    pub fn is_master_broker(&self) -> bool {
        self.master_broker_id().as_deref() == Some(self.self_addr.broker_id.as_str())
    }

    pub fn is_master_broker_blocked(&self) -> bool {
        self.migration_block.is_blocked()
    }

    pub fn config_op_in_progress_count(&self) -> u32 {
        self.migration_block.in_progress_count()
    }

    /// Lock state of a resource, `None` if no election or lock exists.
    pub fn resource_state(&self, name: &str) -> Option<LockState> {
        self.resources.get(name).map(|r| r.lock_state())
    }

    /// Config change events sent to the master broker and not yet answered.
    pub fn pending_config_change_events(&self) -> usize {
        self.event_log_waiters.len()
    }

    pub fn takeover_entry(&self, key: &TakeoverKey) -> Option<TakingoverEntry> {
        self.takeovers.get(key)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop admitting peers. Departures seen from now on are treated as
    /// shutdown by every waiter.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!(broker = %self.self_addr, "Cluster protocol shutting down");
        }
    }

    // ========================================================================
    // Shared state helpers
    // ========================================================================

    pub(crate) fn config_server(&self) -> ConfigServer {
        self.config_server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_config_server(&self, server: ConfigServer) {
        *self.config_server.lock().unwrap_or_else(|e| e.into_inner()) = server;
    }

    pub(crate) fn is_config_server(&self, addr: &BrokerAddress) -> bool {
        self.config_server().broker_id() == Some(addr.broker_id.as_str())
    }

    fn set_config_sync_complete(&self, complete: bool) {
        self.config_sync_complete.store(complete, Ordering::SeqCst);
    }

    fn lock_pretakeovers(&self) -> std::sync::MutexGuard<'_, HashMap<TakeoverKey, u64>> {
        self.my_pretakeovers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn trackers(&self) -> [&ReplyTracker; 5] {
        [
            &self.ack_tracker,
            &self.takeover_pending_tracker,
            &self.new_master_tracker,
            &self.any_ok_tracker,
            &self.config_sync_tracker,
        ]
    }

    /// Register `waiter`, send `packet` to `to` under the waiter's xid and
    /// wait for the reply.
    ///
    /// A reply with a non-OK status is returned as [`ClusterError::Reply`].
    async fn send_and_wait(
        &self,
        tracker: &ReplyTracker,
        to: &BrokerAddress,
        mut packet: ClusterPacket,
        waiter: ReplyWaiter,
        timeout: Duration,
    ) -> ClusterResult<ReplyStatus> {
        let reply_type = waiter.reply_type();
        let xid = tracker.add_waiter(waiter);
        packet.put(PROP_XID, xid);
        packet.reply_requested = true;
        if let Err(e) = self.transport.unicast(to, packet).await {
            tracker.remove_waiter(xid);
            return Err(e);
        }
        let reply = tracker
            .wait_for_reply(xid, timeout)
            .await?
            .ok_or_else(|| ClusterError::reply(reply_type, Status::Error, "request aborted"))?;
        if !reply.status().is_ok() {
            return Err(ClusterError::reply(
                reply_type,
                reply.status(),
                reply.reason().to_string(),
            ));
        }
        Ok(reply)
    }

    /// Route an inbound reply to its waiter.
    fn route_reply(
        &self,
        tracker: &ReplyTracker,
        sender: &BrokerAddress,
        packet: &ClusterPacket,
    ) -> ClusterResult<Option<ClusterPacket>> {
        let xid = packet.xid()?;
        if !tracker.notify_reply(xid, sender, packet.clone()) {
            log_unmatched_reply(tracker, sender, packet);
        }
        Ok(None)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Handle one inbound packet from `sender`.
    pub async fn handle_packet(self: &Arc<Self>, sender: BrokerAddress, packet: ClusterPacket) {
        debug!(from = %sender, packet = %packet, "Received cluster packet");
        let result = match packet.packet_type {
            PacketType::Lock => lock::handle_lock(self, &sender, &packet).await,
            PacketType::LockReply => lock::handle_lock_reply(self, &sender, &packet),
            PacketType::TakeoverPending => {
                takeover::handle_takeover_pending(self, &sender, &packet)
            }
            PacketType::TakeoverPendingReply => {
                self.route_reply(&self.takeover_pending_tracker, &sender, &packet)
            }
            PacketType::TakeoverComplete => {
                takeover::handle_takeover_complete(self, &sender, &packet)
            }
            PacketType::TakeoverAbort => takeover::handle_takeover_abort(self, &sender, &packet),
            PacketType::NewMasterBrokerPrepare => {
                master::handle_prepare(self, &sender, &packet).await
            }
            PacketType::NewMasterBroker => {
                master::handle_new_master_broker(self, &sender, &packet).await
            }
            PacketType::NewMasterBrokerPrepareReply | PacketType::NewMasterBrokerReply => {
                self.route_reply(&self.new_master_tracker, &sender, &packet)
            }
            PacketType::ConfigChangeEvent => {
                config_change::handle_config_change_event(self, &sender, &packet).await
            }
            PacketType::ConfigChangeEventReply => {
                config_change::handle_config_change_event_reply(self, &sender, &packet)
            }
            PacketType::GetConfigChangesRequest => {
                config_change::handle_get_config_changes(self, &sender, &packet).await
            }
            PacketType::GetConfigChangesReply => {
                config_change::handle_get_config_changes_reply(self, &sender, &packet).await
            }
            PacketType::MessageAck => ack::handle_message_ack(self, &sender, &packet).await,
            PacketType::MessageAckReply => self.route_reply(&self.ack_tracker, &sender, &packet),
            PacketType::InfoRequest => info::handle_info_request(self, &sender, &packet),
            PacketType::Info => self.route_reply(&self.any_ok_tracker, &sender, &packet),
            PacketType::Goodbye => goodbye::handle_goodbye(self, &sender, &packet).await,
            PacketType::GoodbyeReply => goodbye::handle_goodbye_reply(self, &sender),
        };

        match result {
            Ok(Some(reply)) => self.send_reply(&sender, reply).await,
            Ok(None) => {}
            Err(e) => {
                metrics::record_handler_error(packet.packet_type.name());
                warn!(
                    from = %sender,
                    packet = %packet,
                    error = %e,
                    "Failed to handle cluster packet"
                );
                if packet.reply_requested
                    && let Some(reply_type) = packet.packet_type.reply_type()
                {
                    let reason = e.to_string();
                    let reply =
                        ClusterPacket::reply_to(&packet, reply_type, e.status(), Some(&reason));
                    self.send_reply(&sender, reply).await;
                }
            }
        }
    }

    async fn send_reply(&self, to: &BrokerAddress, reply: ClusterPacket) {
        let reply_type = reply.packet_type;
        if let Err(e) = self.transport.unicast(to, reply).await {
            warn!(to = %to, reply = %reply_type, error = %e, "Failed to send reply");
        }
    }
}
