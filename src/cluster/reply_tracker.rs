//! Registry of outstanding correlated requests.
//!
//! A [`ReplyTracker`] maps a correlation id (xid) to its [`ReplyWaiter`].
//! The protocol engine keeps one tracker per asynchronous protocol, so an
//! inbound reply is routed by `(protocol, xid)`.
//!
//! ```text
//!  add_waiter ──▶ xid ──▶ send(request, X=xid) ──▶ wait_for_reply(xid)
//!                                                      ▲
//!  inbound reply(X=xid) ──▶ notify_reply(xid, from) ───┘
//!  broker removed ──▶ remove_broker(addr) ──▶ every waiter
//! ```
//!
//! `wait_for_reply` always unregisters the waiter when it returns, including
//! when the awaiting task is cancelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::time::Instant;
use tracing::warn;

use super::address::BrokerAddress;
use super::error::{ClusterError, ClusterResult};
use super::metrics;
use super::packet::ClusterPacket;
use super::reply::{ReplyStatus, ReplyWaiter};
use crate::constants::MAX_WAIT_REPLY_INTERVAL_SECS;

/// Process-unique correlation id generator.
///
/// Ids are the wall-clock millis shifted left 16 bits, bumped by one whenever
/// two ids would collide, so ids stay unique and increasing even if the
/// clock stalls.
#[derive(Debug)]
pub struct XidGenerator {
    last: AtomicU64,
}

impl XidGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> u64 {
        let candidate = (chrono::Utc::now().timestamp_millis().max(0) as u64) << 16;
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(candidate.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        candidate.max(prev + 1)
    }
}

impl Default for XidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static XIDS: Lazy<XidGenerator> = Lazy::new(XidGenerator::new);

/// Next process-unique correlation id.
pub fn next_xid() -> u64 {
    XIDS.next()
}

/// Thread-safe xid → waiter registry for one protocol.
#[derive(Debug)]
pub struct ReplyTracker {
    name: &'static str,
    waiters: DashMap<u64, Arc<ReplyWaiter>>,
    max_wait_interval: Duration,
}

impl ReplyTracker {
    pub fn new(name: &'static str) -> Self {
        Self::with_max_wait_interval(name, Duration::from_secs(MAX_WAIT_REPLY_INTERVAL_SECS))
    }

    /// Tracker whose single condition waits never exceed `max_wait_interval`.
    pub fn with_max_wait_interval(name: &'static str, max_wait_interval: Duration) -> Self {
        Self {
            name,
            waiters: DashMap::new(),
            max_wait_interval,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a waiter under a fresh xid.
    pub fn add_waiter(&self, waiter: ReplyWaiter) -> u64 {
        let waiter = Arc::new(waiter);
        loop {
            let xid = next_xid();
            if self.add_waiter_with_xid(xid, waiter.clone()) {
                return xid;
            }
        }
    }

    /// Register a waiter under a caller-chosen xid.
    ///
    /// Returns false if a waiter is already registered for `xid`.
    pub fn add_waiter_with_xid(&self, xid: u64, waiter: Arc<ReplyWaiter>) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.waiters.entry(xid) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(waiter);
                metrics::ACTIVE_REPLY_WAITERS
                    .with_label_values(&[self.name])
                    .inc();
                true
            }
        }
    }

    pub fn get_waiter(&self, xid: u64) -> Option<Arc<ReplyWaiter>> {
        self.waiters.get(&xid).map(|w| w.value().clone())
    }

    pub fn remove_waiter(&self, xid: u64) {
        if self.waiters.remove(&xid).is_some() {
            metrics::ACTIVE_REPLY_WAITERS
                .with_label_values(&[self.name])
                .dec();
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Wait for the waiter registered under `xid`, then unregister it.
    pub async fn wait_for_reply(
        &self,
        xid: u64,
        timeout: Duration,
    ) -> ClusterResult<Option<ReplyStatus>> {
        let waiter = self.get_waiter(xid).ok_or_else(|| {
            ClusterError::InvalidArgument(format!("no {} waiter for xid {}", self.name, xid))
        })?;
        let _guard = RemoveOnDrop { tracker: self, xid };

        let start = Instant::now();
        let result = waiter.wait_for_reply(timeout, self.max_wait_interval).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.status().as_metric_label(),
        };
        metrics::record_reply_wait(
            waiter.kind().as_metric_label(),
            status,
            start.elapsed().as_secs_f64(),
        );
        result
    }

    /// Route a reply to its waiter. Returns false if no waiter is registered.
    pub fn notify_reply(&self, xid: u64, from: &BrokerAddress, reply: ClusterPacket) -> bool {
        match self.get_waiter(xid) {
            Some(waiter) => {
                waiter.notify_reply(from, reply);
                true
            }
            None => false,
        }
    }

    /// Resolve the waiter for `xid` as OK without a reply, if present.
    pub fn abort_waiter(&self, xid: u64) {
        if let Some(waiter) = self.get_waiter(xid) {
            waiter.abort();
        }
    }

    /// Fan a broker departure out to every registered waiter.
    pub fn remove_broker(&self, remote: &BrokerAddress, goodbyed: bool, shutdown: bool) {
        let waiters: Vec<Arc<ReplyWaiter>> =
            self.waiters.iter().map(|e| e.value().clone()).collect();
        for waiter in waiters {
            waiter.remove_participant(remote, goodbyed, shutdown);
        }
    }
}

struct RemoveOnDrop<'a> {
    tracker: &'a ReplyTracker,
    xid: u64,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        self.tracker.remove_waiter(self.xid);
    }
}

/// Log a reply that arrived for an unknown or already-removed waiter.
pub(crate) fn log_unmatched_reply(tracker: &ReplyTracker, from: &BrokerAddress, reply: &ClusterPacket) {
    metrics::record_unmatched_reply(tracker.name());
    warn!(
        tracker = tracker.name(),
        from = %from,
        reply = %reply,
        "Unable to notify reply, no waiter registered"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::packet::PacketType;
    use crate::cluster::status::Status;
    use crate::constants::PROP_STATUS;
    use std::collections::HashSet;

    fn broker(id: &str) -> BrokerAddress {
        BrokerAddress::new(id, "localhost", 7676, 1, 1)
    }

    fn ok_reply() -> ClusterPacket {
        ClusterPacket::new(PacketType::MessageAckReply).with(PROP_STATUS, Status::Ok.code())
    }

    #[test]
    fn test_xids_are_unique_and_increasing() {
        let gen_ = XidGenerator::new();
        let mut seen = HashSet::new();
        let mut last = 0;
        for _ in 0..10_000 {
            let x = gen_.next();
            assert!(x > last);
            assert!(seen.insert(x));
            last = x;
        }
    }

    #[test]
    fn test_xids_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..1000).map(|_| next_xid()).collect::<Vec<_>>()))
            .collect();
        let mut all = HashSet::new();
        for h in handles {
            for x in h.join().unwrap() {
                assert!(all.insert(x));
            }
        }
        assert_eq!(all.len(), 4000);
    }

    #[tokio::test]
    async fn test_wait_for_reply_removes_waiter() {
        let tracker = ReplyTracker::new("test");
        let home = broker("home");
        let xid = tracker.add_waiter(ReplyWaiter::message_ack(home.clone()));
        assert_eq!(tracker.len(), 1);

        assert!(tracker.notify_reply(xid, &home, ok_reply()));
        let reply = tracker
            .wait_for_reply(xid, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(reply.is_some());
        assert!(tracker.is_empty());

        // Late reply after removal.
        assert!(!tracker.notify_reply(xid, &home, ok_reply()));
    }

    #[tokio::test]
    async fn test_wait_for_reply_removes_waiter_on_timeout() {
        let tracker = ReplyTracker::new("test");
        let xid = tracker.add_waiter(ReplyWaiter::message_ack(broker("home")));
        let err = tracker
            .wait_for_reply(xid, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(tracker.get_waiter(xid).is_none());
    }

    #[tokio::test]
    async fn test_wait_for_unknown_xid_is_error() {
        let tracker = ReplyTracker::new("test");
        let err = tracker
            .wait_for_reply(12345, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_duplicate_xid_rejected() {
        let tracker = ReplyTracker::new("test");
        let w = Arc::new(ReplyWaiter::takeover_pending([broker("b")]));
        assert!(tracker.add_waiter_with_xid(7, w.clone()));
        assert!(!tracker.add_waiter_with_xid(7, w));
        tracker.remove_waiter(7);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_remove_broker_fans_out() {
        let tracker = ReplyTracker::new("test");
        let (b, c) = (broker("b"), broker("c"));
        let x1 = tracker.add_waiter(ReplyWaiter::message_ack(b.clone()));
        let x2 = tracker.add_waiter(ReplyWaiter::takeover_pending([b.clone(), c.clone()]));
        let x3 = tracker.add_waiter(ReplyWaiter::message_ack(c.clone()));

        tracker.remove_broker(&b, false, false);

        let e1 = tracker
            .wait_for_reply(x1, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(e1.status(), Status::Timeout);
        let e2 = tracker
            .wait_for_reply(x2, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(e2.status(), Status::Gone);
        // Not a participant of x3.
        assert_eq!(
            tracker.get_waiter(x3).unwrap().wait_status(),
            crate::cluster::reply::WaitStatus::Waiting
        );
    }

    #[tokio::test]
    async fn test_abort_waiter() {
        let tracker = ReplyTracker::new("test");
        let w = Arc::new(ReplyWaiter::takeover_pending([broker("b")]));
        assert!(tracker.add_waiter_with_xid(99, w));
        tracker.abort_waiter(99);
        let r = tracker
            .wait_for_reply(99, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(r.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_wait_unregisters() {
        let tracker = Arc::new(ReplyTracker::new("test"));
        let xid = tracker.add_waiter(ReplyWaiter::message_ack(broker("home")));
        let t = tracker.clone();
        let handle = tokio::spawn(async move { t.wait_for_reply(xid, Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort();
        let _ = handle.await;
        assert!(tracker.get_waiter(xid).is_none());
    }
}
