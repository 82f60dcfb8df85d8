//! Store-session takeover announcements.
//!
//! Every broker caches the takeovers it has heard of, keyed by the
//! `(broker id, store session)` being taken over. Each announcement (xid)
//! carries the host and broker session of the target incarnation it was
//! made against, plus an expiry:
//!
//! ```text
//!  TAKEOVER_PENDING  ──▶ xid added, expire = pending
//!  pre_takeover_done ──▶ expire = now + takeover timeout
//!  TAKEOVER_COMPLETE ──▶ entry complete (target forever)
//!  TAKEOVER_ABORT    ──▶ xid removed; entry dropped when none remain
//! ```
//!
//! The cache answers whether a connecting broker is a takeover target and
//! replays announcements to brokers that join mid-takeover.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::address::BrokerAddress;
use super::error::ClusterResult;
use super::packet::{ClusterPacket, PacketType};
use crate::constants::{
    PROP_BROKER_HOST, PROP_BROKER_ID, PROP_BROKER_SESSION, PROP_FROM_TAKER, PROP_STORE_SESSION,
    PROP_TIMED_OUT, PROP_XID,
};

/// Identity of a store session being taken over.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TakeoverKey {
    pub broker_id: String,
    pub store_session: u64,
}

impl TakeoverKey {
    pub fn new(broker_id: impl Into<String>, store_session: u64) -> Self {
        Self {
            broker_id: broker_id.into(),
            store_session,
        }
    }

    pub fn of(addr: &BrokerAddress) -> Self {
        Self::new(addr.broker_id.clone(), addr.store_session)
    }
}

impl std::fmt::Display for TakeoverKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "brokerID={}, storeSession={}",
            self.broker_id, self.store_session
        )
    }
}

/// Contents of a takeover packet.
#[derive(Debug, Clone, PartialEq)]
pub struct TakeoverInfo {
    pub key: TakeoverKey,
    /// Host of the target incarnation.
    pub broker_host: Option<String>,
    /// Broker session of the target incarnation.
    pub broker_session: Option<u64>,
    pub xid: Option<u64>,
    /// Sent by the taker itself rather than relayed.
    pub from_taker: bool,
    /// Announced after the target's heartbeat timed out.
    pub timed_out: bool,
    /// The receiver must answer with TAKEOVER_PENDING_REPLY.
    pub need_reply: bool,
}

impl TakeoverInfo {
    /// Announcement made by the taker.
    pub fn pending(key: TakeoverKey, broker_host: String, broker_session: u64, xid: u64) -> Self {
        Self {
            key,
            broker_host: Some(broker_host),
            broker_session: Some(broker_session),
            xid: Some(xid),
            from_taker: true,
            timed_out: false,
            need_reply: true,
        }
    }

    /// Completion or abort notice.
    pub fn notice(key: TakeoverKey, xid: Option<u64>) -> Self {
        Self {
            key,
            broker_host: None,
            broker_session: None,
            xid,
            from_taker: false,
            timed_out: false,
            need_reply: false,
        }
    }

    /// The same announcement as relayed by a non-taker during convergecast.
    pub fn relayed(&self) -> Self {
        Self {
            from_taker: false,
            need_reply: true,
            ..self.clone()
        }
    }

    pub fn to_packet(&self, packet_type: PacketType) -> ClusterPacket {
        let mut packet = ClusterPacket::new(packet_type)
            .with(PROP_BROKER_ID, self.key.broker_id.as_str())
            .with(PROP_STORE_SESSION, self.key.store_session);
        if let Some(host) = &self.broker_host {
            packet.put(PROP_BROKER_HOST, host.as_str());
        }
        if let Some(session) = self.broker_session {
            packet.put(PROP_BROKER_SESSION, session);
        }
        if let Some(xid) = self.xid {
            packet.put(PROP_XID, xid);
        }
        if self.from_taker {
            packet.put(PROP_FROM_TAKER, true);
        }
        if self.timed_out {
            packet.put(PROP_TIMED_OUT, true);
        }
        packet.reply_requested = self.need_reply;
        packet
    }

    pub fn from_packet(packet: &ClusterPacket) -> ClusterResult<Self> {
        Ok(Self {
            key: TakeoverKey::new(
                packet.get_str(PROP_BROKER_ID)?,
                packet.get_long(PROP_STORE_SESSION)? as u64,
            ),
            broker_host: packet.get_str_opt(PROP_BROKER_HOST).map(str::to_string),
            broker_session: packet.get_long(PROP_BROKER_SESSION).ok().map(|s| s as u64),
            xid: packet.xid_opt(),
            from_taker: packet.flag(PROP_FROM_TAKER),
            timed_out: packet.flag(PROP_TIMED_OUT),
            need_reply: packet.reply_requested,
        })
    }
}

impl std::fmt::Display for TakeoverInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)?;
        if let Some(host) = &self.broker_host {
            write!(f, ", brokerHost={}", host)?;
        }
        if let Some(session) = self.broker_session {
            write!(f, ", brokerSession={}", session)?;
        }
        if let Some(xid) = self.xid {
            write!(f, ", xid={}", xid)?;
        }
        if self.from_taker {
            write!(f, ", fromTaker")?;
        }
        Ok(())
    }
}

/// Answer to "is this broker the target of a takeover".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetCheck {
    NotTarget,
    Target,
    /// Every grant expired and the broker is a newer incarnation than any
    /// announcement made against its host. It is a target unless it owns
    /// its store session again.
    UnlessOwner,
}

#[derive(Debug, Clone)]
struct XidEntry {
    xid: u64,
    broker_host: String,
    broker_session: u64,
    /// `None` while the announcing pre-takeover is still running.
    expire: Option<Instant>,
}

impl XidEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expire.is_some_and(|e| now >= e)
    }
}

/// Cached takeover state for one store session.
#[derive(Debug, Clone)]
pub struct TakingoverEntry {
    key: TakeoverKey,
    complete: bool,
    xids: Vec<XidEntry>,
    timeout: Duration,
}

impl TakingoverEntry {
    fn new(key: TakeoverKey, timeout: Duration) -> Self {
        Self {
            key,
            complete: false,
            xids: Vec::new(),
            timeout,
        }
    }

    pub fn key(&self) -> &TakeoverKey {
        &self.key
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Returns false for a repeated xid. A repeated timed-out announcement
    /// still expires the existing grant.
    fn add_xid(&mut self, info: &TakeoverInfo, now: Instant) -> bool {
        let Some(xid) = info.xid else {
            return false;
        };
        if let Some(existing) = self.xids.iter_mut().find(|x| x.xid == xid) {
            if info.timed_out {
                existing.expire = Some(now);
            }
            return false;
        }
        self.xids.push(XidEntry {
            xid,
            broker_host: info.broker_host.clone().unwrap_or_default(),
            broker_session: info.broker_session.unwrap_or_default(),
            expire: info.timed_out.then_some(now),
        });
        true
    }

    fn pre_takeover_done(&mut self, xid: u64, now: Instant) {
        if let Some(x) = self.xids.iter_mut().find(|x| x.xid == xid)
            && x.expire.is_none()
        {
            x.expire = Some(now + self.timeout);
        }
    }

    /// Returns true when no announcement remains.
    fn takeover_abort(&mut self, xid: Option<u64>) -> bool {
        if let Some(xid) = xid {
            self.xids.retain(|x| x.xid != xid);
        }
        self.xids.is_empty()
    }

    pub fn check_target(&self, addr: &BrokerAddress, now: Instant) -> TargetCheck {
        if addr.broker_id != self.key.broker_id || addr.store_session != self.key.store_session {
            return TargetCheck::NotTarget;
        }
        if self.complete {
            return TargetCheck::Target;
        }
        if self.xids.is_empty() {
            return TargetCheck::NotTarget;
        }
        if self.xids.iter().any(|x| x.expire.is_none_or(|e| now <= e)) {
            return TargetCheck::Target;
        }
        let latest_on_host = self
            .xids
            .iter()
            .filter(|x| x.broker_host == addr.host)
            .map(|x| x.broker_session)
            .max();
        match latest_on_host {
            Some(session) if addr.broker_session <= session => TargetCheck::Target,
            _ => TargetCheck::UnlessOwner,
        }
    }

    /// Announcements to replay to a joining broker: COMPLETE, or the most
    /// recent live PENDING per target host.
    pub fn notification_packets(&self, now: Instant) -> Vec<ClusterPacket> {
        if self.complete {
            return vec![self.complete_packet()];
        }
        let mut latest: Vec<&XidEntry> = Vec::new();
        for x in self.xids.iter().filter(|x| !x.is_expired(now)) {
            match latest.iter_mut().find(|l| l.broker_host == x.broker_host) {
                Some(l) if l.broker_session < x.broker_session => *l = x,
                Some(_) => {}
                None => latest.push(x),
            }
        }
        latest.into_iter().map(|x| self.pending_packet(x)).collect()
    }

    /// The announcement to send the target incarnation `addr` itself.
    pub fn notification_packet_for(&self, addr: &BrokerAddress, now: Instant) -> Option<ClusterPacket> {
        if addr.broker_id != self.key.broker_id || addr.store_session != self.key.store_session {
            return None;
        }
        if self.complete {
            return Some(self.complete_packet());
        }
        self.xids
            .iter()
            .filter(|x| x.broker_host == addr.host && !x.is_expired(now))
            .max_by_key(|x| x.broker_session)
            .map(|x| self.pending_packet(x))
    }

    fn complete_packet(&self) -> ClusterPacket {
        TakeoverInfo::notice(self.key.clone(), None).to_packet(PacketType::TakeoverComplete)
    }

    fn pending_packet(&self, x: &XidEntry) -> ClusterPacket {
        TakeoverInfo {
            key: self.key.clone(),
            broker_host: Some(x.broker_host.clone()),
            broker_session: Some(x.broker_session),
            xid: Some(x.xid),
            from_taker: false,
            timed_out: false,
            need_reply: false,
        }
        .to_packet(PacketType::TakeoverPending)
    }
}

impl std::fmt::Display for TakingoverEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, takeoverComplete={}, xids={}]",
            self.key,
            self.complete,
            self.xids.len()
        )
    }
}

/// All takeover entries known to this broker.
#[derive(Debug)]
pub struct TakeoverCache {
    entries: Mutex<HashMap<TakeoverKey, TakingoverEntry>>,
    timeout: Duration,
}

impl TakeoverCache {
    /// `timeout` is the grant an announcement keeps after its pre-takeover
    /// finished.
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TakeoverKey, TakingoverEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an announcement. Returns false if its xid was already known.
    pub fn add(&self, info: &TakeoverInfo) -> bool {
        let now = Instant::now();
        let mut entries = self.lock();
        entries
            .entry(info.key.clone())
            .or_insert_with(|| TakingoverEntry::new(info.key.clone(), self.timeout))
            .add_xid(info, now)
    }

    /// Start the grant for an announcement whose pre-takeover finished.
    pub fn pre_takeover_done(&self, key: &TakeoverKey, xid: u64) {
        let now = Instant::now();
        if let Some(entry) = self.lock().get_mut(key) {
            entry.pre_takeover_done(xid, now);
        }
    }

    /// Mark a takeover complete. Returns false if it already was.
    pub fn complete(&self, key: &TakeoverKey) -> bool {
        let mut entries = self.lock();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| TakingoverEntry::new(key.clone(), self.timeout));
        !std::mem::replace(&mut entry.complete, true)
    }

    /// Drop an aborted announcement, and the entry once none remain.
    pub fn abort(&self, info: &TakeoverInfo) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&info.key)
            && entry.takeover_abort(info.xid)
        {
            entries.remove(&info.key);
        }
    }

    pub fn check_target(&self, addr: &BrokerAddress) -> TargetCheck {
        let now = Instant::now();
        self.lock()
            .get(&TakeoverKey::of(addr))
            .map_or(TargetCheck::NotTarget, |e| e.check_target(addr, now))
    }

    pub fn get(&self, key: &TakeoverKey) -> Option<TakingoverEntry> {
        self.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> Vec<TakingoverEntry> {
        self.lock().values().cloned().collect()
    }

    pub fn notification_packets(&self) -> Vec<ClusterPacket> {
        let now = Instant::now();
        self.lock()
            .values()
            .flat_map(|e| e.notification_packets(now))
            .collect()
    }

    pub fn notification_packet_for(&self, addr: &BrokerAddress) -> Option<ClusterPacket> {
        let now = Instant::now();
        self.lock()
            .get(&TakeoverKey::of(addr))
            .and_then(|e| e.notification_packet_for(addr, now))
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

    const GRANT: Duration = Duration::from_secs(60);

    fn target(session: u64) -> BrokerAddress {
        BrokerAddress::new("d", "host-d", 7676, 42, session)
    }

    fn announce(xid: u64, session: u64) -> TakeoverInfo {
        TakeoverInfo::pending(TakeoverKey::new("d", 42), "host-d".into(), session, xid)
    }

    #[test]
    fn test_packet_roundtrip_keeps_flags() {
        let info = announce(9, 3);
        let back = TakeoverInfo::from_packet(&info.to_packet(PacketType::TakeoverPending)).unwrap();
        assert_eq!(back, info);

        let relayed = info.relayed();
        let back =
            TakeoverInfo::from_packet(&relayed.to_packet(PacketType::TakeoverPending)).unwrap();
        assert!(!back.from_taker);
        assert!(back.need_reply);
    }

    #[test]
    fn test_duplicate_xid_not_added() {
        let cache = TakeoverCache::new(GRANT);
        assert!(cache.add(&announce(1, 3)));
        assert!(!cache.add(&announce(1, 3)));
        assert!(cache.add(&announce(2, 3)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_pending_announcement_targets_store_session_only() {
        let cache = TakeoverCache::new(GRANT);
        cache.add(&announce(1, 3));
        assert_eq!(cache.check_target(&target(3)), TargetCheck::Target);
        // A later incarnation is still a target while the grant is live.
        assert_eq!(cache.check_target(&target(4)), TargetCheck::Target);
        let other_session = BrokerAddress::new("d", "host-d", 7676, 43, 3);
        assert_eq!(cache.check_target(&other_session), TargetCheck::NotTarget);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_grant_targets_only_old_incarnations() {
        let cache = TakeoverCache::new(GRANT);
        let key = TakeoverKey::new("d", 42);
        cache.add(&announce(1, 3));
        cache.pre_takeover_done(&key, 1);
        assert_eq!(cache.check_target(&target(4)), TargetCheck::Target);

        tokio::time::advance(GRANT + Duration::from_secs(1)).await;
        assert_eq!(cache.check_target(&target(3)), TargetCheck::Target);
        assert_eq!(cache.check_target(&target(4)), TargetCheck::UnlessOwner);
        let moved = BrokerAddress::new("d", "host-e", 7676, 42, 2);
        assert_eq!(cache.check_target(&moved), TargetCheck::UnlessOwner);
    }

    #[test]
    fn test_abort_removes_entry_when_last_xid_goes() {
        let cache = TakeoverCache::new(GRANT);
        let key = TakeoverKey::new("d", 42);
        cache.add(&announce(1, 3));
        cache.add(&announce(2, 3));
        cache.abort(&TakeoverInfo::notice(key.clone(), Some(1)));
        assert_eq!(cache.check_target(&target(3)), TargetCheck::Target);
        cache.abort(&TakeoverInfo::notice(key, Some(2)));
        assert!(cache.is_empty());
        assert_eq!(cache.check_target(&target(3)), TargetCheck::NotTarget);
    }

    #[test]
    fn test_complete_is_permanent_and_reported_once() {
        let cache = TakeoverCache::new(GRANT);
        let key = TakeoverKey::new("d", 42);
        assert!(cache.complete(&key));
        assert!(!cache.complete(&key));
        assert_eq!(cache.check_target(&target(99)), TargetCheck::Target);
        let packets = cache.notification_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type, PacketType::TakeoverComplete);
    }

    #[test]
    fn test_notifications_keep_latest_session_per_host() {
        let cache = TakeoverCache::new(GRANT);
        cache.add(&announce(1, 3));
        cache.add(&announce(2, 5));
        cache.add(&announce(3, 4));
        let packets = cache.notification_packets();
        assert_eq!(packets.len(), 1);
        let info = TakeoverInfo::from_packet(&packets[0]).unwrap();
        assert_eq!(info.xid, Some(2));
        assert!(!packets[0].reply_requested);

        let for_target = cache.notification_packet_for(&target(5)).unwrap();
        assert_eq!(TakeoverInfo::from_packet(&for_target).unwrap().xid, Some(2));
        let elsewhere = BrokerAddress::new("d", "host-e", 7676, 42, 5);
        assert!(cache.notification_packet_for(&elsewhere).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_announcement_expires_immediately() {
        let cache = TakeoverCache::new(GRANT);
        let mut info = announce(1, 3);
        info.timed_out = true;
        cache.add(&info);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.notification_packets().is_empty());
        assert_eq!(cache.check_target(&target(3)), TargetCheck::Target);
        assert_eq!(cache.check_target(&target(4)), TargetCheck::UnlessOwner);
    }
}
