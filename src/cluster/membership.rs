//! Live broker list.
//!
//! Every peer admitted by `add_broker_info` gets a [`BrokerInfoEx`] that
//! tracks its goodbye handshake and whether it has been deactivated. The
//! entry is dropped from the [`BrokerList`] by `remove_broker_info`.
//!
//! # Goodbye handshake
//!
//! ```text
//!  this broker                      peer
//!  GOODBYE ─────────────────────▶  GOODBYE_RECEIVED
//!  GOODBYE_SENT              ◀──── GOODBYE_REPLY
//!  GOODBYE_REPLY_RECEIVED
//! ```
//!
//! A peer whose GOODBYE was received and answered has left cleanly; its
//! departure does not fail convergecast waits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::address::{BrokerAddress, BrokerInfo};

/// Admission decision for a connecting peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddBrokerInfoResult {
    /// Peer admitted.
    Ok,
    /// Not admitted now; the transport should retry later.
    Retry,
    /// Peer rejected; the transport should close the link and not retry.
    Ban,
}

impl AddBrokerInfoResult {
    pub fn as_metric_label(self) -> &'static str {
        match self {
            AddBrokerInfoResult::Ok => "ok",
            AddBrokerInfoResult::Retry => "retry",
            AddBrokerInfoResult::Ban => "ban",
        }
    }
}

impl std::fmt::Display for AddBrokerInfoResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddBrokerInfoResult::Ok => write!(f, "ADD_BROKERINFO_OK"),
            AddBrokerInfoResult::Retry => write!(f, "ADD_BROKERINFO_RETRY"),
            AddBrokerInfoResult::Ban => write!(f, "ADD_BROKERINFO_BAN"),
        }
    }
}

/// Goodbye handshake bits of one peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GoodbyeState {
    pub sent: bool,
    pub received: bool,
    pub reply_sent: bool,
    pub reply_received: bool,
}

/// A live peer.
#[derive(Debug)]
pub struct BrokerInfoEx {
    info: BrokerInfo,
    goodbye: Mutex<GoodbyeState>,
    deactivated: AtomicBool,
    deactivate_notify: Notify,
}

impl BrokerInfoEx {
    pub fn new(info: BrokerInfo) -> Self {
        Self {
            info,
            goodbye: Mutex::new(GoodbyeState::default()),
            deactivated: AtomicBool::new(false),
            deactivate_notify: Notify::new(),
        }
    }

    pub fn info(&self) -> &BrokerInfo {
        &self.info
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.info.address
    }

    fn goodbye_mut(&self) -> std::sync::MutexGuard<'_, GoodbyeState> {
        self.goodbye.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn goodbye_state(&self) -> GoodbyeState {
        *self.goodbye_mut()
    }

    pub fn set_goodbye_sent(&self) {
        self.goodbye_mut().sent = true;
    }

    pub fn set_goodbye_received(&self) {
        self.goodbye_mut().received = true;
    }

    pub fn set_goodbye_reply_sent(&self) {
        self.goodbye_mut().reply_sent = true;
    }

    pub fn set_goodbye_reply_received(&self) {
        self.goodbye_mut().reply_received = true;
    }

    /// Either side started the goodbye handshake.
    pub fn sent_or_received_goodbye(&self) -> bool {
        let g = self.goodbye_mut();
        g.sent || g.received
    }

    /// The peer announced its departure and this broker acknowledged it.
    pub fn goodbye_done(&self) -> bool {
        let g = self.goodbye_mut();
        g.received && g.reply_sent
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivated.load(Ordering::SeqCst)
    }

    pub fn deactivate(&self) {
        self.deactivated.store(true, Ordering::SeqCst);
        self.deactivate_notify.notify_waiters();
    }

    /// Wait until the peer is deactivated or `timeout` elapses.
    ///
    /// Returns the deactivated flag.
    pub async fn wait_deactivated(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.deactivate_notify.notified();
            if self.is_deactivated() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }
}

/// Peers currently admitted into the cluster, keyed by incarnation.
#[derive(Debug, Default)]
pub struct BrokerList {
    brokers: Mutex<HashMap<BrokerAddress, Arc<BrokerInfoEx>>>,
}

impl BrokerList {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BrokerAddress, Arc<BrokerInfoEx>>> {
        self.brokers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, addr: &BrokerAddress) -> Option<Arc<BrokerInfoEx>> {
        self.lock().get(addr).cloned()
    }

    /// Any live incarnation of `broker_id`.
    pub fn get_by_id(&self, broker_id: &str) -> Option<Arc<BrokerInfoEx>> {
        self.lock()
            .values()
            .find(|b| b.address().broker_id == broker_id)
            .cloned()
    }

    /// The live peer serving `store_session`.
    pub fn get_by_store_session(&self, store_session: u64) -> Option<Arc<BrokerInfoEx>> {
        self.lock()
            .values()
            .find(|b| b.address().store_session == store_session)
            .cloned()
    }

    /// Insert a new peer. Returns `None`, leaving the list unchanged, if the
    /// incarnation is already present.
    pub fn insert_if_absent(&self, info: BrokerInfo) -> Option<Arc<BrokerInfoEx>> {
        use std::collections::hash_map::Entry;
        match self.lock().entry(info.address.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(v) => Some(v.insert(Arc::new(BrokerInfoEx::new(info))).clone()),
        }
    }

    pub fn remove(&self, addr: &BrokerAddress) -> Option<Arc<BrokerInfoEx>> {
        self.lock().remove(addr)
    }

    /// Addresses of every live peer except `except`.
    pub fn addresses(&self, except: Option<&BrokerAddress>) -> Vec<BrokerAddress> {
        self.lock()
            .keys()
            .filter(|a| except != Some(*a))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<BrokerInfoEx>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CURRENT_PROTOCOL_VERSION;

    fn info(id: &str, session: u64) -> BrokerInfo {
        BrokerInfo::new(
            BrokerAddress::new(id, "localhost", 7676, 10, session),
            CURRENT_PROTOCOL_VERSION,
        )
    }

    #[test]
    fn test_insert_is_per_incarnation() {
        let list = BrokerList::new();
        assert!(list.insert_if_absent(info("a", 1)).is_some());
        assert!(list.insert_if_absent(info("a", 1)).is_none());
        assert!(list.insert_if_absent(info("a", 2)).is_some());
        assert_eq!(list.len(), 2);
        assert!(list.get_by_id("a").is_some());
        assert!(list.get_by_store_session(10).is_some());
    }

    #[test]
    fn test_addresses_excludes_sender() {
        let list = BrokerList::new();
        list.insert_if_absent(info("a", 1));
        list.insert_if_absent(info("b", 1));
        let a = info("a", 1).address;
        let rest = list.addresses(Some(&a));
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].broker_id, "b");
        assert_eq!(list.addresses(None).len(), 2);
    }

    #[test]
    fn test_goodbye_done_after_acknowledged_goodbye() {
        let ex = BrokerInfoEx::new(info("a", 1));
        assert!(!ex.sent_or_received_goodbye());
        ex.set_goodbye_sent();
        ex.set_goodbye_reply_received();
        assert!(ex.sent_or_received_goodbye());
        assert!(!ex.goodbye_done());
        ex.set_goodbye_received();
        assert!(!ex.goodbye_done());
        ex.set_goodbye_reply_sent();
        assert!(ex.goodbye_done());
    }

    #[tokio::test]
    async fn test_wait_deactivated_wakes_on_deactivate() {
        let ex = Arc::new(BrokerInfoEx::new(info("a", 1)));
        let waiter = ex.clone();
        let handle =
            tokio::spawn(async move { waiter.wait_deactivated(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ex.deactivate();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_deactivated_times_out() {
        let ex = BrokerInfoEx::new(info("a", 1));
        assert!(!ex.wait_deactivated(Duration::from_millis(20)).await);
    }
}
