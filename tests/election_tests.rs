//! Resource election across brokers on the in-memory network.

use std::sync::Arc;
use std::time::Duration;

use raptor_cluster::cluster::{
    BrokerAddress, ClusterConfig, ClusterProfile, LockState, LockStatus, MemoryConfigStore,
    MockNetwork, ProtocolEngine, RecordingCallbacks,
};

fn addr(id: &str, store_session: u64) -> BrokerAddress {
    BrokerAddress::new(id, format!("host-{id}"), 7676, store_session, 1)
}

fn broker(net: &Arc<MockNetwork>, id: &str, store_session: u64) -> Arc<ProtocolEngine> {
    net.add_broker(
        ClusterConfig::from_profile(ClusterProfile::Testing),
        addr(id, store_session),
        Arc::new(MemoryConfigStore::new()),
        Arc::new(RecordingCallbacks::new()),
    )
}

async fn cluster(net: &Arc<MockNetwork>, ids: &[&str]) -> Vec<Arc<ProtocolEngine>> {
    let engines: Vec<_> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| broker(net, id, 10 + i as u64))
        .collect();
    for (i, a) in engines.iter().enumerate() {
        for b in &engines[i + 1..] {
            net.connect(a.self_address(), b.self_address()).await;
        }
    }
    engines
}

#[tokio::test]
async fn test_older_timestamp_wins_concurrent_election() {
    let net = MockNetwork::new();
    let engines = cluster(&net, &["a", "b"]).await;
    let (a, b) = (&engines[0], &engines[1]);

    let (ra, rb) = tokio::join!(
        a.lock_resource("durable:c1:sub", 100, "a"),
        b.lock_resource("durable:c1:sub", 200, "b"),
    );

    assert_eq!(ra, LockStatus::Success);
    assert_eq!(rb, LockStatus::Failure);
    assert_eq!(a.resource_state("durable:c1:sub"), Some(LockState::Locked));
    assert_eq!(b.resource_state("durable:c1:sub"), None);
}

#[tokio::test]
async fn test_three_brokers_single_winner() {
    let net = MockNetwork::new();
    let engines = cluster(&net, &["a", "b", "c"]).await;

    let (ra, rb, rc) = tokio::join!(
        engines[0].lock_resource("clientid:app", 300, "a"),
        engines[1].lock_resource("clientid:app", 100, "b"),
        engines[2].lock_resource("clientid:app", 200, "c"),
    );

    assert_eq!(ra, LockStatus::Failure);
    assert_eq!(rb, LockStatus::Success);
    assert_eq!(rc, LockStatus::Failure);
}

#[tokio::test]
async fn test_equal_timestamps_terminate_with_at_most_one_winner() {
    let net = MockNetwork::new();
    let engines = cluster(&net, &["a", "b"]).await;
    let (a, b) = (&engines[0], &engines[1]);

    let (ra, rb) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(
            a.lock_resource("durable:tie", 500, "a"),
            b.lock_resource("durable:tie", 500, "b"),
        )
    })
    .await
    .expect("contended election did not terminate");

    for r in [ra, rb] {
        assert!(matches!(r, LockStatus::Success | LockStatus::Failure), "{r}");
    }
    assert!(!(ra == LockStatus::Success && rb == LockStatus::Success));
}

#[tokio::test]
async fn test_shared_locks_coexist_across_brokers() {
    let net = MockNetwork::new();
    let engines = cluster(&net, &["a", "b"]).await;
    let (a, b) = (&engines[0], &engines[1]);

    assert_eq!(a.lock_shared_resource("queue:shared", "a").await, LockStatus::Success);
    assert_eq!(b.lock_shared_resource("queue:shared", "b").await, LockStatus::Success);
    assert_eq!(
        b.lock_resource("queue:exclusive", 0, "b").await,
        LockStatus::Success
    );
    assert_eq!(
        a.lock_resource("queue:exclusive", 0, "a").await,
        LockStatus::Failure
    );
}

#[tokio::test]
async fn test_unlock_lets_another_broker_win() {
    let net = MockNetwork::new();
    let engines = cluster(&net, &["a", "b"]).await;
    let (a, b) = (&engines[0], &engines[1]);

    assert_eq!(a.lock_resource("durable:x", 10, "a").await, LockStatus::Success);
    assert_eq!(b.lock_resource("durable:x", 20, "b").await, LockStatus::Failure);
    a.unlock_resource("durable:x");
    assert_eq!(b.lock_resource("durable:x", 20, "b").await, LockStatus::Success);
}

#[tokio::test]
async fn test_unreachable_peer_is_closed_and_election_wins() {
    let net = MockNetwork::new();
    let engines = cluster(&net, &["a", "b"]).await;
    let (a, b) = (&engines[0], &engines[1]);
    net.set_unreachable(b.self_address(), true);

    assert_eq!(a.lock_resource("durable:y", 10, "a").await, LockStatus::Success);
    assert!(!net.is_linked(a.self_address(), b.self_address()));
    assert!(a.broker_list().is_empty());
}

#[tokio::test]
async fn test_queue_lock_times_out_without_closing_links() {
    let net = MockNetwork::new();
    let engines = cluster(&net, &["a", "b"]).await;
    let (a, b) = (&engines[0], &engines[1]);
    net.set_unreachable(b.self_address(), true);

    assert_eq!(a.lock_resource("queue:orders", 10, "a").await, LockStatus::Timeout);
    assert!(net.is_linked(a.self_address(), b.self_address()));
    assert_eq!(a.resource_state("queue:orders"), None);
}

#[tokio::test]
async fn test_peer_leaving_mid_election_releases_its_vote() {
    let net = MockNetwork::new();
    let engines = cluster(&net, &["a", "b", "c"]).await;
    let (a, c) = (engines[0].clone(), &engines[2]);
    net.set_silent(c.self_address(), true);

    let election = tokio::spawn(async move { a.lock_resource("durable:z", 10, "a").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    net.disconnect(engines[0].self_address(), c.self_address()).await;

    assert_eq!(election.await.unwrap(), LockStatus::Success);
}

#[tokio::test]
async fn test_failed_broadcast_still_collects_votes() {
    let net = MockNetwork::new();
    let engines = cluster(&net, &["a", "b", "c"]).await;
    let (a, b) = (&engines[0], &engines[1]);
    net.fail_broadcasts(a.self_address(), true);

    assert_eq!(a.lock_resource("durable:w", 10, "a").await, LockStatus::Success);
    assert_eq!(a.resource_state("durable:w"), Some(LockState::Locked));
    assert_eq!(b.lock_resource("durable:w", 20, "b").await, LockStatus::Failure);
}
