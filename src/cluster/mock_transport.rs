//! In-memory cluster for testing.
//!
//! [`MockNetwork`] wires any number of [`ProtocolEngine`]s together without
//! sockets. Every engine gets its own [`Transport`] handle; packets are
//! delivered by spawning the receiver's [`ProtocolEngine::handle_packet`].
//!
//! Failure injection:
//!
//! - [`MockNetwork::set_unreachable`]: packets to the broker are dropped and
//!   [`Transport::is_reachable`] reports false
//! - [`MockNetwork::set_silent`]: packets to the broker are dropped, but it
//!   still looks reachable
//! - [`MockNetwork::drop_packets`]: packets of one type to the broker are
//!   dropped
//! - [`MockNetwork::disconnect`]: the link goes down on both sides
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! raptor-cluster = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::address::{BrokerAddress, BrokerInfo};
use super::change_record::ChangeRecord;
use super::config::ClusterConfig;
use super::engine::ProtocolEngine;
use super::error::{ClusterError, ClusterResult};
use super::membership::AddBrokerInfoResult;
use super::packet::{ClusterPacket, PacketType};
use super::status::Status;
use super::transport::{BrokerCallbacks, ConfigChangeStore, LinkId, Transport};

/// A packet handed to the network.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub from: BrokerAddress,
    pub to: BrokerAddress,
    pub packet: ClusterPacket,
}

#[derive(Default)]
struct NetState {
    nodes: HashMap<BrokerAddress, Weak<ProtocolEngine>>,
    infos: HashMap<BrokerAddress, BrokerInfo>,
    links: HashMap<BrokerAddress, HashMap<BrokerAddress, LinkId>>,
    unreachable: HashSet<BrokerAddress>,
    silent: HashSet<BrokerAddress>,
    dropped_types: HashSet<(BrokerAddress, PacketType)>,
    failing_broadcasters: HashSet<BrokerAddress>,
    sent: Vec<SentPacket>,
}

impl NetState {
    fn link(&self, a: &BrokerAddress, b: &BrokerAddress) -> Option<LinkId> {
        self.links.get(a).and_then(|peers| peers.get(b)).copied()
    }

    fn peers(&self, a: &BrokerAddress) -> Vec<(BrokerAddress, LinkId)> {
        self.links
            .get(a)
            .map(|peers| peers.iter().map(|(p, l)| (p.clone(), *l)).collect())
            .unwrap_or_default()
    }

    fn unlink(&mut self, a: &BrokerAddress, b: &BrokerAddress) -> bool {
        let removed = self
            .links
            .get_mut(a)
            .and_then(|peers| peers.remove(b))
            .is_some();
        if let Some(peers) = self.links.get_mut(b) {
            peers.remove(a);
        }
        removed
    }
}

/// In-memory cluster of protocol engines.
#[derive(Default)]
pub struct MockNetwork {
    state: Mutex<NetState>,
    next_link: AtomicU64,
}

impl std::fmt::Debug for MockNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockNetwork")
            .field("nodes", &state.nodes.len())
            .field("sent", &state.sent.len())
            .finish()
    }
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an engine for `addr` attached to this network.
    ///
    /// The network only keeps a weak reference; the caller owns the engine.
    pub fn add_broker(
        self: &Arc<Self>,
        config: ClusterConfig,
        addr: BrokerAddress,
        store: Arc<dyn ConfigChangeStore>,
        callbacks: Arc<dyn BrokerCallbacks>,
    ) -> Arc<ProtocolEngine> {
        let info = BrokerInfo::new(addr.clone(), config.protocol_version);
        let transport = Arc::new(MockTransport {
            network: self.clone(),
            local: addr.clone(),
        });
        let engine = ProtocolEngine::new(config, addr.clone(), transport, store, callbacks);
        let mut state = self.lock();
        state.nodes.insert(addr.clone(), Arc::downgrade(&engine));
        state.infos.insert(addr, info);
        engine
    }

    /// Override the handshake info `addr` presents to its peers.
    pub fn set_broker_info(&self, info: BrokerInfo) {
        self.lock().infos.insert(info.address.clone(), info);
    }

    pub fn engine(&self, addr: &BrokerAddress) -> Option<Arc<ProtocolEngine>> {
        self.lock().nodes.get(addr).and_then(Weak::upgrade)
    }

    /// Bring a link up and run the handshake on both sides.
    ///
    /// If either side does not answer `Ok` the link is torn down again.
    pub async fn connect(
        &self,
        a: &BrokerAddress,
        b: &BrokerAddress,
    ) -> (AddBrokerInfoResult, AddBrokerInfoResult) {
        let link = self.next_link.fetch_add(1, Ordering::SeqCst) + 1;
        let (engine_a, engine_b, info_a, info_b) = {
            let mut state = self.lock();
            state.links.entry(a.clone()).or_default().insert(b.clone(), link);
            state.links.entry(b.clone()).or_default().insert(a.clone(), link);
            (
                state.nodes.get(a).and_then(Weak::upgrade),
                state.nodes.get(b).and_then(Weak::upgrade),
                state.infos.get(a).cloned(),
                state.infos.get(b).cloned(),
            )
        };
        let (Some(engine_a), Some(engine_b), Some(info_a), Some(info_b)) =
            (engine_a, engine_b, info_a, info_b)
        else {
            self.lock().unlink(a, b);
            return (AddBrokerInfoResult::Ban, AddBrokerInfoResult::Ban);
        };

        let result_a = engine_a.add_broker_info(info_b).await;
        let result_b = engine_b.add_broker_info(info_a).await;
        if result_a != AddBrokerInfoResult::Ok || result_b != AddBrokerInfoResult::Ok {
            debug!(a = %a, b = %b, %result_a, %result_b, "Handshake refused, dropping link");
            self.lock().unlink(a, b);
            engine_a.remove_broker_info(b).await;
            engine_b.remove_broker_info(a).await;
        }
        (result_a, result_b)
    }

    /// Take the link down and remove each side from the other.
    pub async fn disconnect(&self, a: &BrokerAddress, b: &BrokerAddress) {
        let (removed, engine_a, engine_b) = {
            let mut state = self.lock();
            (
                state.unlink(a, b),
                state.nodes.get(a).and_then(Weak::upgrade),
                state.nodes.get(b).and_then(Weak::upgrade),
            )
        };
        if !removed {
            return;
        }
        if let Some(engine) = engine_a {
            engine.remove_broker_info(b).await;
        }
        if let Some(engine) = engine_b {
            engine.remove_broker_info(a).await;
        }
    }

    pub fn is_linked(&self, a: &BrokerAddress, b: &BrokerAddress) -> bool {
        self.lock().link(a, b).is_some()
    }

    pub fn set_unreachable(&self, addr: &BrokerAddress, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(addr.clone());
        } else {
            state.unreachable.remove(addr);
        }
    }

    pub fn set_silent(&self, addr: &BrokerAddress, silent: bool) {
        let mut state = self.lock();
        if silent {
            state.silent.insert(addr.clone());
        } else {
            state.silent.remove(addr);
        }
    }

    /// Make broadcasts from `addr` report an error after reaching every peer.
    pub fn fail_broadcasts(&self, addr: &BrokerAddress, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.failing_broadcasters.insert(addr.clone());
        } else {
            state.failing_broadcasters.remove(addr);
        }
    }

    /// Drop every `packet_type` packet sent to `addr` (or stop dropping).
    pub fn drop_packets(&self, addr: &BrokerAddress, packet_type: PacketType, drop: bool) {
        let mut state = self.lock();
        if drop {
            state.dropped_types.insert((addr.clone(), packet_type));
        } else {
            state.dropped_types.remove(&(addr.clone(), packet_type));
        }
    }

    pub fn sent_log(&self) -> Vec<SentPacket> {
        self.lock().sent.clone()
    }

    pub fn sent_of_type(&self, packet_type: PacketType) -> Vec<SentPacket> {
        self.lock()
            .sent
            .iter()
            .filter(|s| s.packet.packet_type == packet_type)
            .cloned()
            .collect()
    }

    fn deliver(
        &self,
        from: &BrokerAddress,
        to: &BrokerAddress,
        packet: ClusterPacket,
    ) -> ClusterResult<()> {
        let target = {
            let mut state = self.lock();
            if state.link(from, to).is_none() {
                return Err(ClusterError::NotConnected(to.clone()));
            }
            state.sent.push(SentPacket {
                from: from.clone(),
                to: to.clone(),
                packet: packet.clone(),
            });
            if state.unreachable.contains(to)
                || state.silent.contains(to)
                || state.dropped_types.contains(&(to.clone(), packet.packet_type))
            {
                debug!(from = %from, to = %to, packet = %packet, "Packet dropped");
                return Ok(());
            }
            state
                .nodes
                .get(to)
                .and_then(Weak::upgrade)
                .ok_or_else(|| ClusterError::NotConnected(to.clone()))?
        };
        let from = from.clone();
        tokio::spawn(async move { target.handle_packet(from, packet).await });
        Ok(())
    }
}

/// One broker's handle on a [`MockNetwork`].
#[derive(Debug)]
pub struct MockTransport {
    network: Arc<MockNetwork>,
    local: BrokerAddress,
}

#[async_trait]
impl Transport for MockTransport {
    async fn unicast(&self, to: &BrokerAddress, packet: ClusterPacket) -> ClusterResult<()> {
        self.network.deliver(&self.local, to, packet)
    }

    async fn unicast_and_close(
        &self,
        to: &BrokerAddress,
        packet: ClusterPacket,
    ) -> ClusterResult<()> {
        let result = self.network.deliver(&self.local, to, packet);
        self.close_link(to, true).await;
        result
    }

    async fn broadcast(&self, packet: ClusterPacket) -> ClusterResult<()> {
        self.broadcast_urgent(packet).await.map(|_| ())
    }

    async fn broadcast_urgent(
        &self,
        packet: ClusterPacket,
    ) -> ClusterResult<Vec<(BrokerAddress, LinkId)>> {
        let peers = self.network.lock().peers(&self.local);
        let mut sent = Vec::with_capacity(peers.len());
        for (peer, link) in peers {
            match self.network.deliver(&self.local, &peer, packet.clone()) {
                Ok(()) => sent.push((peer, link)),
                Err(e) => debug!(to = %peer, error = %e, "Broadcast send failed"),
            }
        }
        if self.network.lock().failing_broadcasters.contains(&self.local) {
            return Err(ClusterError::Transport(format!(
                "broadcast from {} interrupted",
                self.local
            )));
        }
        Ok(sent)
    }

    async fn close_link(&self, addr: &BrokerAddress, force: bool) {
        debug!(local = %self.local, peer = %addr, force, "Closing link");
        self.network.disconnect(&self.local, addr).await;
    }

    async fn is_reachable(&self, addr: &BrokerAddress, _timeout: Duration) -> ClusterResult<bool> {
        let state = self.network.lock();
        Ok(state.link(&self.local, addr).is_some() && !state.unreachable.contains(addr))
    }

    fn is_link_modified(&self, addr: &BrokerAddress, link: LinkId) -> bool {
        self.network.lock().link(&self.local, addr) != Some(link)
    }
}

/// Change record store kept in memory.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    records: Mutex<Vec<ChangeRecord>>,
    refresh: Mutex<Option<(String, i64)>>,
    fail_append: AtomicBool,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ChangeRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Make every following append fail.
    pub fn fail_append(&self, fail: bool) {
        self.fail_append.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfigChangeStore for MemoryConfigStore {
    async fn append(&self, record: ChangeRecord) -> ClusterResult<()> {
        if self.fail_append.load(Ordering::SeqCst) {
            return Err(ClusterError::Store("append refused".into()));
        }
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }

    async fn records_since(&self, since: Option<i64>) -> ClusterResult<Vec<ChangeRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .iter()
            .filter(|r| since.is_none_or(|ts| r.timestamp > ts))
            .cloned()
            .collect())
    }

    async fn clear(&self) -> ClusterResult<()> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    fn last_refresh_time(&self) -> Option<i64> {
        self.refresh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(_, ts)| *ts)
    }

    fn last_config_server(&self) -> Option<String> {
        self.refresh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(server, _)| server.clone())
    }

    fn set_last_refresh(&self, config_server: &str, timestamp: i64) {
        *self.refresh.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((config_server.to_string(), timestamp));
    }
}

type MasterChange = (Option<BrokerAddress>, BrokerAddress);

/// Broker callbacks that record every call.
#[derive(Debug)]
pub struct RecordingCallbacks {
    activated: Mutex<Vec<BrokerAddress>>,
    deactivated: Mutex<Vec<BrokerAddress>>,
    applied: Mutex<Vec<ChangeRecord>>,
    master_changes: Mutex<Vec<MasterChange>>,
    restarts: Mutex<Vec<String>>,
    acks: Mutex<Vec<BrokerAddress>>,
    owned_sessions: Mutex<HashSet<u64>>,
    ack_status: Mutex<(Status, Option<String>)>,
    fail_activation: AtomicBool,
    fail_apply: AtomicBool,
}

impl Default for RecordingCallbacks {
    fn default() -> Self {
        Self {
            activated: Mutex::default(),
            deactivated: Mutex::default(),
            applied: Mutex::default(),
            master_changes: Mutex::default(),
            restarts: Mutex::default(),
            acks: Mutex::default(),
            owned_sessions: Mutex::default(),
            ack_status: Mutex::new((Status::Ok, None)),
            fail_activation: AtomicBool::new(false),
            fail_apply: AtomicBool::new(false),
        }
    }
}

fn snapshot<T: Clone>(m: &Mutex<Vec<T>>) -> Vec<T> {
    m.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

fn push<T>(m: &Mutex<Vec<T>>, item: T) {
    m.lock().unwrap_or_else(|e| e.into_inner()).push(item);
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_activation(&self, fail: bool) {
        self.fail_activation.store(fail, Ordering::SeqCst);
    }

    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub fn add_owned_session(&self, store_session: u64) {
        self.owned_sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(store_session);
    }

    pub fn set_ack_status(&self, status: Status, reason: Option<&str>) {
        *self.ack_status.lock().unwrap_or_else(|e| e.into_inner()) =
            (status, reason.map(str::to_string));
    }

    pub fn activated(&self) -> Vec<BrokerAddress> {
        snapshot(&self.activated)
    }

    pub fn deactivated(&self) -> Vec<BrokerAddress> {
        snapshot(&self.deactivated)
    }

    pub fn applied(&self) -> Vec<ChangeRecord> {
        snapshot(&self.applied)
    }

    pub fn master_changes(&self) -> Vec<MasterChange> {
        snapshot(&self.master_changes)
    }

    pub fn restarts(&self) -> Vec<String> {
        snapshot(&self.restarts)
    }

    /// Senders of every message ack processed so far.
    pub fn acks(&self) -> Vec<BrokerAddress> {
        snapshot(&self.acks)
    }
}

#[async_trait]
impl BrokerCallbacks for RecordingCallbacks {
    async fn activate_broker(&self, info: &BrokerInfo) -> ClusterResult<()> {
        if self.fail_activation.load(Ordering::SeqCst) {
            return Err(ClusterError::Transport("activation refused".into()));
        }
        push(&self.activated, info.address.clone());
        Ok(())
    }

    async fn deactivate_broker(&self, addr: &BrokerAddress) {
        push(&self.deactivated, addr.clone());
    }

    fn owns_store_session(&self, store_session: u64) -> bool {
        self.owned_sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&store_session)
    }

    async fn apply_change_record(&self, record: &ChangeRecord) -> ClusterResult<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(ClusterError::Store("apply refused".into()));
        }
        push(&self.applied, record.clone());
        Ok(())
    }

    fn master_broker_changed(&self, old: Option<&BrokerAddress>, new: &BrokerAddress) {
        push(&self.master_changes, (old.cloned(), new.clone()));
    }

    async fn handle_message_ack(
        &self,
        from: &BrokerAddress,
        _packet: &ClusterPacket,
    ) -> (Status, Option<String>) {
        push(&self.acks, from.clone());
        self.ack_status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn restart_broker(&self, reason: &str) {
        push(&self.restarts, reason.to_string());
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
