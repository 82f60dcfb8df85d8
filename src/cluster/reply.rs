//! Correlated request/multi-reply state machine.
//!
//! A [`ReplyWaiter`] tracks one outstanding request sent to a set of
//! participant brokers and decides its terminal status from the replies and
//! participant departures it observes:
//!
//! ```text
//!                 reply / departure
//!   ┌─────────┐ ───────────────────▶ ┌────┐
//!   │ WAITING │                      │ OK │  (or TIMEOUT / GONE)
//!   └─────────┘ ◀─────── never ───── └────┘
//! ```
//!
//! The liveness policy is selected by [`WaiterKind`]:
//!
//! | Kind             | Resolves OK                     | Resolves GONE / TIMEOUT                    |
//! |------------------|---------------------------------|--------------------------------------------|
//! | `Unicast`        | first reply from the target     | target departs (GONE if goodbyed, else TIMEOUT) |
//! | `MessageAck`     | first reply from the home       | same as `Unicast`                          |
//! | `BroadcastAnyOk` | first reply with status OK      | every participant answered non-OK or left  |
//! | `TakeoverPending`| every participant answered or said goodbye | any hard departure or shutdown  |
//!
//! Waits re-check the status against an absolute deadline in a loop, each
//! single wait bounded by a maximum interval, so spurious wake-ups and lost
//! notifications cannot hang a caller.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::address::BrokerAddress;
use super::error::{ClusterError, ClusterResult};
use super::packet::{ClusterPacket, PacketType};
use super::status::Status;

/// Liveness policy of a waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaiterKind {
    /// Single target broker.
    Unicast { target: BrokerAddress },
    /// Single target: the home broker of an acknowledged message.
    MessageAck { home: BrokerAddress },
    /// Any OK reply wins.
    BroadcastAnyOk,
    /// All participants must reply or leave gracefully.
    TakeoverPending,
}

impl WaiterKind {
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            WaiterKind::Unicast { .. } => "unicast",
            WaiterKind::MessageAck { .. } => "message_ack",
            WaiterKind::BroadcastAnyOk => "any_ok",
            WaiterKind::TakeoverPending => "takeover_pending",
        }
    }

    fn single_target(&self) -> Option<&BrokerAddress> {
        match self {
            WaiterKind::Unicast { target } => Some(target),
            WaiterKind::MessageAck { home } => Some(home),
            _ => None,
        }
    }
}

/// State of a waiter. Leaves `Waiting` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Waiting,
    Ok,
    Timeout,
    Gone,
}

impl WaitStatus {
    fn to_status(self) -> Status {
        match self {
            WaitStatus::Ok => Status::Ok,
            WaitStatus::Timeout => Status::Timeout,
            WaitStatus::Gone => Status::Gone,
            WaitStatus::Waiting => Status::Error,
        }
    }
}

/// A reply received from a participant.
#[derive(Debug, Clone)]
pub struct ReplyStatus {
    from: BrokerAddress,
    packet: ClusterPacket,
}

impl ReplyStatus {
    pub fn new(from: BrokerAddress, packet: ClusterPacket) -> Self {
        Self { from, packet }
    }

    /// Status the participant answered with.
    pub fn status(&self) -> Status {
        self.packet.status()
    }

    pub fn reason(&self) -> &str {
        self.packet.reason()
    }

    pub fn sender(&self) -> &BrokerAddress {
        &self.from
    }

    pub fn packet(&self) -> &ClusterPacket {
        &self.packet
    }

    pub fn into_packet(self) -> ClusterPacket {
        self.packet
    }
}

#[derive(Debug)]
struct WaiterState {
    status: WaitStatus,
    participants: HashSet<BrokerAddress>,
    replies: HashMap<BrokerAddress, ReplyStatus>,
    ok_broker: Option<BrokerAddress>,
}

/// One outstanding correlated request.
#[derive(Debug)]
pub struct ReplyWaiter {
    kind: WaiterKind,
    reply_type: PacketType,
    state: Mutex<WaiterState>,
    notify: Notify,
}

impl ReplyWaiter {
    /// Create a waiter expecting replies of `reply_type` from `participants`.
    pub fn new(
        kind: WaiterKind,
        participants: impl IntoIterator<Item = BrokerAddress>,
        reply_type: PacketType,
    ) -> Self {
        Self {
            kind,
            reply_type,
            state: Mutex::new(WaiterState {
                status: WaitStatus::Waiting,
                participants: participants.into_iter().collect(),
                replies: HashMap::new(),
                ok_broker: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Waiter for a single target broker.
    pub fn unicast(target: BrokerAddress, reply_type: PacketType) -> Self {
        Self::new(
            WaiterKind::Unicast {
                target: target.clone(),
            },
            [target],
            reply_type,
        )
    }

    /// Waiter for a message acknowledgement from the message home broker.
    pub fn message_ack(home: BrokerAddress) -> Self {
        Self::new(
            WaiterKind::MessageAck { home: home.clone() },
            [home],
            PacketType::MessageAckReply,
        )
    }

    /// Waiter resolved by the first OK reply from any of `participants`.
    pub fn broadcast_any_ok(
        participants: impl IntoIterator<Item = BrokerAddress>,
        reply_type: PacketType,
    ) -> Self {
        Self::new(WaiterKind::BroadcastAnyOk, participants, reply_type)
    }

    /// Convergecast waiter for TAKEOVER_PENDING acknowledgements.
    pub fn takeover_pending(participants: impl IntoIterator<Item = BrokerAddress>) -> Self {
        Self::new(
            WaiterKind::TakeoverPending,
            participants,
            PacketType::TakeoverPendingReply,
        )
    }

    pub fn kind(&self) -> &WaiterKind {
        &self.kind
    }

    pub fn reply_type(&self) -> PacketType {
        self.reply_type
    }

    pub fn wait_status(&self) -> WaitStatus {
        self.lock().status
    }

    /// Brokers still expected to answer.
    pub fn participants(&self) -> Vec<BrokerAddress> {
        self.lock().participants.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, WaiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve(&self, state: &mut WaiterState, status: WaitStatus) {
        if state.status == WaitStatus::Waiting {
            state.status = status;
        }
        self.notify.notify_waiters();
    }

    /// Block until the waiter resolves or `timeout` elapses.
    ///
    /// Returns the resolved reply when the status is OK. The reply is `None`
    /// for an aborted waiter and for convergecast waiters, which have no
    /// single reply. Any other terminal status is returned as
    /// [`ClusterError::Reply`].
    pub async fn wait_for_reply(
        &self,
        timeout: Duration,
        max_interval: Duration,
    ) -> ClusterResult<Option<ReplyStatus>> {
        let deadline = Instant::now() + timeout;
        let mut round = 0u32;

        loop {
            // Registered before the status check so a resolve in between still wakes us.
            let notified = self.notify.notified();

            let wait = {
                let mut state = self.lock();
                if state.status != WaitStatus::Waiting {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    state.status = WaitStatus::Timeout;
                    break;
                }
                let remaining = deadline - now;
                if round > 0 {
                    info!(
                        round,
                        reply = %self.reply_type,
                        participants = %format_participants(&state.participants),
                        "Waiting for reply"
                    );
                }
                remaining.min(max_interval)
            };

            let _ = tokio::time::timeout(wait, notified).await;
            round += 1;
        }

        let state = self.lock();
        match state.status {
            WaitStatus::Ok => Ok(self.resolved_reply(&state)),
            other => Err(ClusterError::reply(
                self.reply_type,
                other.to_status(),
                format!(
                    "waiting on [{}]",
                    format_participants(&state.participants)
                ),
            )),
        }
    }

    fn resolved_reply(&self, state: &WaiterState) -> Option<ReplyStatus> {
        match &self.kind {
            WaiterKind::Unicast { target } => state.replies.get(target).cloned(),
            WaiterKind::MessageAck { home } => state.replies.get(home).cloned(),
            WaiterKind::BroadcastAnyOk => state
                .ok_broker
                .as_ref()
                .and_then(|b| state.replies.get(b))
                .cloned(),
            WaiterKind::TakeoverPending => None,
        }
    }

    /// Resolve a still-waiting waiter as OK without a reply.
    pub fn abort(&self) {
        let mut state = self.lock();
        if state.status != WaitStatus::Waiting {
            return;
        }
        state.status = WaitStatus::Ok;
        self.notify.notify_waiters();
    }

    /// Record a reply. Only counts if `from` is still an expected participant
    /// and the waiter has not resolved yet.
    pub fn notify_reply(&self, from: &BrokerAddress, reply: ClusterPacket) {
        let mut state = self.lock();
        if state.status != WaitStatus::Waiting {
            debug!(from = %from, reply = %reply, "Reply after waiter resolved, ignored");
            return;
        }
        if !state.participants.remove(from) {
            debug!(from = %from, reply = %reply, "Reply from non-participant, ignored");
            return;
        }
        let ok = reply.status().is_ok();
        state
            .replies
            .insert(from.clone(), ReplyStatus::new(from.clone(), reply));

        match &self.kind {
            WaiterKind::Unicast { .. } | WaiterKind::MessageAck { .. } => {
                self.resolve(&mut state, WaitStatus::Ok);
            }
            WaiterKind::BroadcastAnyOk => {
                if ok {
                    state.ok_broker = Some(from.clone());
                    self.resolve(&mut state, WaitStatus::Ok);
                } else if state.participants.is_empty() {
                    self.resolve(&mut state, WaitStatus::Gone);
                }
            }
            WaiterKind::TakeoverPending => {
                if state.participants.is_empty() {
                    self.resolve(&mut state, WaitStatus::Ok);
                }
            }
        }
    }

    /// A broker left the cluster. No-op unless still waiting.
    pub fn remove_participant(&self, remote: &BrokerAddress, goodbyed: bool, shutdown: bool) {
        let mut state = self.lock();
        if state.status != WaitStatus::Waiting {
            return;
        }
        match &self.kind {
            WaiterKind::Unicast { .. } | WaiterKind::MessageAck { .. } => {
                state.participants.remove(remote);
                let is_target = self.kind.single_target() == Some(remote);
                if !is_target && !shutdown {
                    return;
                }
                let status = if goodbyed {
                    WaitStatus::Gone
                } else {
                    WaitStatus::Timeout
                };
                self.resolve(&mut state, status);
            }
            WaiterKind::BroadcastAnyOk => {
                state.participants.remove(remote);
                if shutdown || state.participants.is_empty() {
                    self.resolve(&mut state, WaitStatus::Gone);
                }
            }
            WaiterKind::TakeoverPending => {
                if !state.participants.contains(remote) && !shutdown {
                    return;
                }
                if shutdown || !goodbyed {
                    self.resolve(&mut state, WaitStatus::Gone);
                    return;
                }
                state.participants.remove(remote);
                if state.participants.is_empty() {
                    self.resolve(&mut state, WaitStatus::Ok);
                }
            }
        }
    }
}

fn format_participants(participants: &HashSet<BrokerAddress>) -> String {
    participants
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PROP_STATUS;

    fn broker(id: &str) -> BrokerAddress {
        BrokerAddress::new(id, format!("host-{id}"), 7676, 1, 1)
    }

    fn reply(status: Status) -> ClusterPacket {
        ClusterPacket::new(PacketType::Info).with(PROP_STATUS, status.code())
    }

    const SHORT: Duration = Duration::from_millis(50);
    const INTERVAL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_unicast_resolves_on_target_reply() {
        let b = broker("b");
        let w = ReplyWaiter::unicast(b.clone(), PacketType::NewMasterBrokerReply);
        w.notify_reply(&b, reply(Status::Error));
        let r = w.wait_for_reply(SHORT, INTERVAL).await.unwrap().unwrap();
        // The waiter resolves OK; the peer's status is for the caller to judge.
        assert_eq!(r.status(), Status::Error);
        assert_eq!(r.sender(), &b);
    }

    #[tokio::test]
    async fn test_unicast_target_departure() {
        let b = broker("b");
        let w = ReplyWaiter::unicast(b.clone(), PacketType::NewMasterBrokerReply);
        w.remove_participant(&broker("other"), false, false);
        assert_eq!(w.wait_status(), WaitStatus::Waiting);

        w.remove_participant(&b, true, false);
        let err = w.wait_for_reply(SHORT, INTERVAL).await.unwrap_err();
        assert_eq!(err.status(), Status::Gone);

        let w = ReplyWaiter::message_ack(b.clone());
        w.remove_participant(&b, false, false);
        assert_eq!(w.wait_status(), WaitStatus::Timeout);
    }

    #[tokio::test]
    async fn test_unicast_any_departure_on_shutdown() {
        let w = ReplyWaiter::unicast(broker("b"), PacketType::NewMasterBrokerReply);
        w.remove_participant(&broker("c"), false, true);
        assert_eq!(w.wait_status(), WaitStatus::Timeout);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let w = ReplyWaiter::unicast(broker("b"), PacketType::NewMasterBrokerReply);
        let err = w.wait_for_reply(SHORT, INTERVAL).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(w.wait_status(), WaitStatus::Timeout);
    }

    #[tokio::test]
    async fn test_any_ok_first_ok_wins() {
        let (b, c) = (broker("b"), broker("c"));
        let w = ReplyWaiter::broadcast_any_ok([b.clone(), c.clone()], PacketType::Info);
        w.notify_reply(&b, reply(Status::NotFound));
        assert_eq!(w.wait_status(), WaitStatus::Waiting);
        w.notify_reply(&c, reply(Status::Ok));
        let r = w.wait_for_reply(SHORT, INTERVAL).await.unwrap().unwrap();
        assert_eq!(r.sender(), &c);
    }

    #[tokio::test]
    async fn test_any_ok_all_negative_is_gone() {
        let (b, c) = (broker("b"), broker("c"));
        let w = ReplyWaiter::broadcast_any_ok([b.clone(), c.clone()], PacketType::Info);
        w.notify_reply(&b, reply(Status::NotFound));
        w.remove_participant(&c, false, false);
        assert_eq!(w.wait_status(), WaitStatus::Gone);
    }

    #[tokio::test]
    async fn test_takeover_pending_needs_all() {
        let (b, c) = (broker("b"), broker("c"));
        let w = ReplyWaiter::takeover_pending([b.clone(), c.clone()]);
        w.notify_reply(&b, reply(Status::Ok));
        assert_eq!(w.wait_status(), WaitStatus::Waiting);
        w.remove_participant(&c, true, false);
        assert!(w.wait_for_reply(SHORT, INTERVAL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_takeover_pending_hard_departure_is_gone() {
        let (b, c) = (broker("b"), broker("c"));
        let w = ReplyWaiter::takeover_pending([b.clone(), c.clone()]);
        w.remove_participant(&b, false, false);
        assert_eq!(w.wait_status(), WaitStatus::Gone);
    }

    #[tokio::test]
    async fn test_takeover_pending_non_participant_departure_ignored() {
        let w = ReplyWaiter::takeover_pending([broker("b")]);
        w.remove_participant(&broker("z"), false, false);
        assert_eq!(w.wait_status(), WaitStatus::Waiting);
        w.remove_participant(&broker("z"), false, true);
        assert_eq!(w.wait_status(), WaitStatus::Gone);
    }

    #[tokio::test]
    async fn test_replies_after_resolution_are_ignored() {
        let (b, c) = (broker("b"), broker("c"));
        let w = ReplyWaiter::broadcast_any_ok([b.clone(), c.clone()], PacketType::Info);
        w.notify_reply(&b, reply(Status::Ok));
        w.notify_reply(&c, reply(Status::Ok));
        assert_eq!(w.participants(), vec![c.clone()]);
        let r = w.wait_for_reply(SHORT, INTERVAL).await.unwrap().unwrap();
        assert_eq!(r.sender(), &b);
    }

    #[tokio::test]
    async fn test_status_never_returns_to_waiting() {
        let b = broker("b");
        let w = ReplyWaiter::unicast(b.clone(), PacketType::NewMasterBrokerReply);
        w.remove_participant(&b, true, false);
        w.abort();
        w.notify_reply(&b, reply(Status::Ok));
        assert_eq!(w.wait_status(), WaitStatus::Gone);
    }

    #[tokio::test]
    async fn test_abort_resolves_ok_without_reply() {
        let w = ReplyWaiter::takeover_pending([broker("b")]);
        w.abort();
        assert!(w.wait_for_reply(SHORT, INTERVAL).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_wait_rechecks_each_interval() {
        let b = broker("b");
        let w = std::sync::Arc::new(ReplyWaiter::unicast(b.clone(), PacketType::MessageAckReply));
        let waiter = w.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_reply(Duration::from_secs(300), Duration::from_secs(60))
                .await
        });
        tokio::time::sleep(Duration::from_secs(130)).await;
        w.notify_reply(&b, reply(Status::Ok));
        let r = handle.await.unwrap().unwrap();
        assert!(r.is_some());
    }
}
