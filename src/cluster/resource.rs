//! Per-resource election state.
//!
//! A [`Resource`] exists in the [`ResourceTable`] only while an election for
//! it is running (`Locking`) or the lock is held (`Locked`). Failure, timeout
//! and unlock all remove it.
//!
//! # Vote collection
//!
//! Each election round has its own xid. Votes carrying another round's xid
//! are discarded, so a slow SUCCESS from a previous round can never count
//! towards the current one.
//!
//! ```text
//!  prepare_lock_request(peers, xid) ──▶ status = SUCCESS, recipients = peers
//!  update_recipients(sent)          ──▶ drop peers the broadcast missed
//!  consume_response(xid, SUCCESS)   ──▶ recipient removed
//!  consume_response(xid, FAILURE)   ──▶ status = FAILURE
//!  broker_added                     ──▶ status = TRY_AGAIN
//!  implied_failure                  ──▶ status = FAILURE
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

use super::address::BrokerAddress;
use super::status::LockStatus;
use super::transport::{LinkId, Transport};

/// Lifecycle of a resource entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// An election is in progress.
    Locking,
    /// The election was won and the lock is held.
    Locked,
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockState::Locking => write!(f, "RESOURCE_LOCKING"),
            LockState::Locked => write!(f, "RESOURCE_LOCKED"),
        }
    }
}

#[derive(Debug)]
struct ElectionState {
    lock_state: LockState,
    xid: u64,
    status: LockStatus,
    /// Peers whose vote is outstanding, with the link the request went out
    /// on once known.
    recipients: HashMap<BrokerAddress, Option<LinkId>>,
}

/// Election state for one named resource.
#[derive(Debug)]
pub struct Resource {
    name: String,
    owner: String,
    shared: bool,
    timestamp: i64,
    state: Mutex<ElectionState>,
    notify: Notify,
}

impl Resource {
    pub fn new(name: impl Into<String>, owner: impl Into<String>, shared: bool, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            shared,
            timestamp,
            state: Mutex::new(ElectionState {
                lock_state: LockState::Locking,
                xid: 0,
                status: LockStatus::Success,
                recipients: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ElectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Creation timestamp used as the election tie-breaker.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn xid(&self) -> u64 {
        self.state().xid
    }

    pub fn lock_state(&self) -> LockState {
        self.state().lock_state
    }

    pub fn set_lock_state(&self, lock_state: LockState) {
        self.state().lock_state = lock_state;
    }

    pub fn status(&self) -> LockStatus {
        self.state().status
    }

    /// Peers whose vote for the current round is outstanding.
    pub fn recipients(&self) -> Vec<BrokerAddress> {
        self.state().recipients.keys().cloned().collect()
    }

    /// Start a round: expect a vote from every broker in `peers`.
    pub fn prepare_lock_request(&self, peers: &[BrokerAddress], xid: u64) {
        let mut state = self.state();
        state.recipients = peers.iter().map(|p| (p.clone(), None)).collect();
        state.xid = xid;
        state.status = LockStatus::Success;
    }

    /// Narrow the recipients to the brokers the request actually reached.
    ///
    /// Recipients that already voted are not re-added.
    pub fn update_recipients(&self, sent: &[(BrokerAddress, LinkId)]) {
        let sent: HashMap<&BrokerAddress, LinkId> = sent.iter().map(|(a, l)| (a, *l)).collect();
        let mut state = self.state();
        state.recipients.retain(|addr, link| match sent.get(addr) {
            Some(l) => {
                *link = Some(*l);
                true
            }
            None => false,
        });
        drop(state);
        self.notify.notify_waiters();
    }

    /// Record one vote. Votes for another round or after the round was
    /// decided are ignored.
    pub fn consume_response(&self, xid: u64, sender: &BrokerAddress, response: LockStatus) {
        let mut state = self.state();
        if xid != state.xid || state.status != LockStatus::Success {
            return;
        }
        match response {
            LockStatus::Success => {
                state.recipients.remove(sender);
            }
            LockStatus::Failure | LockStatus::Backoff => state.status = response,
            LockStatus::Timeout | LockStatus::TryAgain => {}
        }
        let decided = state.status != LockStatus::Success || state.recipients.is_empty();
        drop(state);
        if decided {
            self.notify.notify_waiters();
        }
    }

    /// A competing election with an older timestamp wins; ours fails.
    pub fn implied_failure(&self) {
        self.state().status = LockStatus::Failure;
        self.notify.notify_waiters();
    }

    /// Membership grew mid-round; the round must restart.
    pub fn broker_added(&self, _broker: &BrokerAddress) {
        self.state().status = LockStatus::TryAgain;
        self.notify.notify_waiters();
    }

    /// A recipient left; its vote is no longer expected.
    pub fn broker_removed(&self, broker: &BrokerAddress) {
        let mut state = self.state();
        if state.status != LockStatus::Success {
            return;
        }
        state.recipients.remove(broker);
        let empty = state.recipients.is_empty();
        drop(state);
        if empty {
            self.notify.notify_waiters();
        }
    }

    fn decided(&self) -> Option<LockStatus> {
        let state = self.state();
        if state.status != LockStatus::Success || state.recipients.is_empty() {
            Some(state.status)
        } else {
            None
        }
    }

    /// Wait until every recipient voted SUCCESS, a vote decided the round,
    /// or `timeout` elapsed.
    ///
    /// On the first deadline, unless `fail_on_timeout`, unreachable
    /// recipients are force-closed and the deadline is re-armed once. A
    /// round that still times out reports TRY_AGAIN if any recipient's link
    /// changed since the request went out, otherwise TIMEOUT.
    pub async fn wait_for_status_change(
        &self,
        timeout: Duration,
        max_interval: Duration,
        fail_on_timeout: bool,
        transport: &dyn Transport,
    ) -> LockStatus {
        let mut deadline = Instant::now() + timeout;
        let mut check_reachable = true;
        loop {
            let notified = self.notify.notified();
            if let Some(status) = self.decided() {
                return status;
            }
            let now = Instant::now();
            if now >= deadline {
                if !fail_on_timeout && check_reachable {
                    check_reachable = false;
                    if self.close_unreachable(timeout, transport).await {
                        deadline = Instant::now() + timeout;
                        continue;
                    }
                }
                if self.need_restart(transport) {
                    return LockStatus::TryAgain;
                }
                warn!(
                    resource = %self.name,
                    recipients = ?self.recipients().iter().map(|r| r.to_string()).collect::<Vec<_>>(),
                    "Timed out waiting for lock votes"
                );
                return LockStatus::Timeout;
            }
            let wait = (deadline - now).min(max_interval);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn close_unreachable(&self, timeout: Duration, transport: &dyn Transport) -> bool {
        let mut closed = false;
        for addr in self.recipients() {
            match transport.is_reachable(&addr, timeout).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(broker = %addr, resource = %self.name, "Closing link to unreachable broker");
                    transport.close_link(&addr, true).await;
                    closed = true;
                }
                Err(e) => {
                    warn!(broker = %addr, error = %e, "Cannot check broker reachability");
                }
            }
        }
        closed
    }

    fn need_restart(&self, transport: &dyn Transport) -> bool {
        self.state()
            .recipients
            .iter()
            .any(|(addr, link)| link.is_some_and(|l| transport.is_link_modified(addr, l)))
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        write!(
            f,
            "[{}, owner={}, {}, timestamp={}, shared={}, xid={}]",
            self.name, self.owner, state.lock_state, self.timestamp, self.shared, state.xid
        )
    }
}

/// Outcome of trying to register a new election.
#[derive(Debug)]
pub enum ResourceEntry {
    /// A fresh entry was created; the caller runs the election.
    Created(Arc<Resource>),
    /// An entry for this name already exists.
    Existing(Arc<Resource>),
}

/// Name → resource table owned by the protocol engine.
#[derive(Debug, Default)]
pub struct ResourceTable {
    resources: Mutex<HashMap<String, Arc<Resource>>>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Resource>>> {
        self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Resource>> {
        self.table().get(name).cloned()
    }

    /// Insert `resource` unless an entry for its name exists.
    pub fn insert_if_absent(&self, resource: Resource) -> ResourceEntry {
        let mut table = self.table();
        if let Some(existing) = table.get(resource.name()) {
            return ResourceEntry::Existing(existing.clone());
        }
        let resource = Arc::new(resource);
        table.insert(resource.name().to_string(), resource.clone());
        ResourceEntry::Created(resource)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Resource>> {
        self.table().remove(name)
    }

    /// Remove the entry only if it is still `resource`.
    pub fn remove_if_same(&self, resource: &Arc<Resource>) {
        let mut table = self.table();
        if table
            .get(resource.name())
            .is_some_and(|r| Arc::ptr_eq(r, resource))
        {
            table.remove(resource.name());
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<Resource>> {
        self.table().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(id: &str) -> BrokerAddress {
        BrokerAddress::new(id, "localhost", 7676, 1, 1)
    }

    #[test]
    fn test_all_success_votes_decide_round() {
        let res = Resource::new("durable:foo", "a", false, 100);
        let (b, c) = (broker("b"), broker("c"));
        res.prepare_lock_request(&[b.clone(), c.clone()], 7);
        assert!(res.decided().is_none());
        res.consume_response(7, &b, LockStatus::Success);
        assert!(res.decided().is_none());
        res.consume_response(7, &c, LockStatus::Success);
        assert_eq!(res.decided(), Some(LockStatus::Success));
    }

    #[test]
    fn test_stale_round_vote_is_discarded() {
        let res = Resource::new("durable:foo", "a", false, 100);
        let b = broker("b");
        res.prepare_lock_request(&[b.clone()], 8);
        res.consume_response(7, &b, LockStatus::Success);
        res.consume_response(7, &b, LockStatus::Failure);
        assert_eq!(res.recipients(), vec![b]);
        assert_eq!(res.status(), LockStatus::Success);
    }

    #[test]
    fn test_failure_vote_is_sticky() {
        let res = Resource::new("durable:foo", "a", false, 100);
        let (b, c) = (broker("b"), broker("c"));
        res.prepare_lock_request(&[b.clone(), c.clone()], 1);
        res.consume_response(1, &b, LockStatus::Backoff);
        res.consume_response(1, &c, LockStatus::Failure);
        assert_eq!(res.decided(), Some(LockStatus::Backoff));
    }

    #[test]
    fn test_update_recipients_drops_unsent_and_keeps_voted_out() {
        let res = Resource::new("clientid:x", "a", false, 100);
        let (b, c, d) = (broker("b"), broker("c"), broker("d"));
        res.prepare_lock_request(&[b.clone(), c.clone(), d.clone()], 1);
        // c's vote beats the send bookkeeping.
        res.consume_response(1, &c, LockStatus::Success);
        res.update_recipients(&[(b.clone(), 10), (c.clone(), 11)]);
        assert_eq!(res.recipients(), vec![b]);
    }

    #[test]
    fn test_broker_removed_ignored_after_decision() {
        let res = Resource::new("durable:foo", "a", false, 100);
        let b = broker("b");
        res.prepare_lock_request(&[b.clone()], 1);
        res.implied_failure();
        res.broker_removed(&b);
        assert_eq!(res.recipients().len(), 1);
        assert_eq!(res.decided(), Some(LockStatus::Failure));
    }

    #[test]
    fn test_broker_added_forces_try_again() {
        let res = Resource::new("durable:foo", "a", false, 100);
        res.prepare_lock_request(&[broker("b")], 1);
        res.broker_added(&broker("c"));
        assert_eq!(res.decided(), Some(LockStatus::TryAgain));
    }

    #[test]
    fn test_table_insert_if_absent() {
        let table = ResourceTable::new();
        let first = match table.insert_if_absent(Resource::new("queue:q", "a", true, 1)) {
            ResourceEntry::Created(r) => r,
            ResourceEntry::Existing(_) => panic!("expected a new entry"),
        };
        match table.insert_if_absent(Resource::new("queue:q", "b", true, 2)) {
            ResourceEntry::Existing(r) => assert!(Arc::ptr_eq(&r, &first)),
            ResourceEntry::Created(_) => panic!("expected the existing entry"),
        }
        assert_eq!(table.len(), 1);

        let other = Arc::new(Resource::new("queue:q", "c", false, 3));
        table.remove_if_same(&other);
        assert_eq!(table.len(), 1);
        table.remove_if_same(&first);
        assert!(table.is_empty());
    }

    #[test]
    fn test_display() {
        let res = Resource::new("durable:foo", "owner-a", false, 100);
        assert_eq!(
            res.to_string(),
            "[durable:foo, owner=owner-a, RESOURCE_LOCKING, timestamp=100, shared=false, xid=0]"
        );
    }
}
