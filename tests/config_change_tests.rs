//! Config change events and config sync with the master broker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use raptor_cluster::cluster::mock_transport::wait_until;
use raptor_cluster::cluster::{
    AddBrokerInfoResult, BrokerAddress, ChangeEvent, ClusterConfig, ClusterError, ClusterProfile,
    MemoryConfigStore, MockNetwork, ProtocolEngine, RecordingCallbacks, Status,
};

const WAIT: Duration = Duration::from_secs(3);

fn addr(id: &str, store_session: u64, broker_session: u64) -> BrokerAddress {
    BrokerAddress::new(id, format!("host-{id}"), 7676, store_session, broker_session)
}

fn config(master: Option<&str>) -> ClusterConfig {
    let mut config = ClusterConfig::from_profile(ClusterProfile::Testing);
    config.master_broker = master.map(str::to_string);
    config
}

struct Broker {
    engine: Arc<ProtocolEngine>,
    store: Arc<MemoryConfigStore>,
    callbacks: Arc<RecordingCallbacks>,
}

fn broker_with_store(
    net: &Arc<MockNetwork>,
    address: BrokerAddress,
    store: Arc<MemoryConfigStore>,
) -> Broker {
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = net.add_broker(config(Some("a")), address, store.clone(), callbacks.clone());
    Broker {
        engine,
        store,
        callbacks,
    }
}

fn broker(net: &Arc<MockNetwork>, id: &str, store_session: u64) -> Broker {
    broker_with_store(
        net,
        addr(id, store_session, 1),
        Arc::new(MemoryConfigStore::new()),
    )
}

async fn synced_pair(net: &Arc<MockNetwork>) -> (Broker, Broker) {
    let a = broker(net, "a", 1);
    let b = broker(net, "b", 2);
    let (ra, rb) = net
        .connect(a.engine.self_address(), b.engine.self_address())
        .await;
    assert_eq!((ra, rb), (AddBrokerInfoResult::Ok, AddBrokerInfoResult::Ok));
    assert!(wait_until(WAIT, || b.engine.is_config_sync_complete()).await);
    (a, b)
}

fn destination(name: &str) -> ChangeEvent {
    ChangeEvent::DestinationUpdate {
        dest_type: "queue".to_string(),
        name: name.to_string(),
        attrs: BTreeMap::new(),
    }
}

#[tokio::test]
async fn test_no_master_broker_records_nothing() {
    let net = MockNetwork::new();
    let store = Arc::new(MemoryConfigStore::new());
    let engine = net.add_broker(
        config(None),
        addr("a", 1, 1),
        store.clone(),
        Arc::new(RecordingCallbacks::new()),
    );

    engine.record_config_change_event(destination("orders")).await.unwrap();
    assert!(store.records().is_empty());
}

#[tokio::test]
async fn test_unresolved_master_broker_refuses_changes() {
    let net = MockNetwork::new();
    let b = broker(&net, "b", 2);

    let err = b
        .engine
        .record_config_change_event(destination("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::MasterNotResolved(ref id) if id == "a"), "{err}");
}

#[tokio::test]
async fn test_follower_changes_are_stamped_by_master() {
    let net = MockNetwork::new();
    let (a, b) = synced_pair(&net).await;

    b.engine
        .record_update_destination("queue", "orders", BTreeMap::new())
        .await
        .unwrap();
    b.engine
        .record_create_subscription("client-1", "audit", "orders")
        .await
        .unwrap();
    a.engine.record_unsubscribe("client-1", "audit").await.unwrap();

    let records = a.store.records();
    assert_eq!(records.len(), 3);
    assert!(records.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert!(b.store.records().is_empty());
}

#[tokio::test]
async fn test_initial_sync_replays_compacted_log() {
    let net = MockNetwork::new();
    let a = broker(&net, "a", 1);
    a.engine
        .record_update_destination("queue", "orders", BTreeMap::new())
        .await
        .unwrap();
    a.engine.record_remove_destination("queue", "orders").await.unwrap();
    a.engine
        .record_update_destination("topic", "prices", BTreeMap::new())
        .await
        .unwrap();

    let b = broker(&net, "b", 2);
    net.connect(a.engine.self_address(), b.engine.self_address())
        .await;
    assert!(wait_until(WAIT, || b.engine.is_config_sync_complete()).await);

    let applied = b.callbacks.applied();
    assert_eq!(applied.len(), 2);
    assert!(applied[0].is_reset());
    assert!(matches!(
        &applied[1].event,
        ChangeEvent::DestinationUpdate { name, .. } if name == "prices"
    ));
}

#[tokio::test]
async fn test_reconnect_syncs_only_newer_records() {
    let net = MockNetwork::new();
    let a = broker(&net, "a", 1);
    a.engine.record_config_change_event(destination("orders")).await.unwrap();
    let b = broker(&net, "b", 2);
    net.connect(a.engine.self_address(), b.engine.self_address())
        .await;
    assert!(wait_until(WAIT, || b.engine.is_config_sync_complete()).await);
    assert_eq!(b.callbacks.applied().len(), 2);

    net.disconnect(a.engine.self_address(), b.engine.self_address())
        .await;
    a.engine.record_config_change_event(destination("prices")).await.unwrap();

    // Same store, new incarnation.
    let restarted = broker_with_store(&net, addr("b", 2, 2), b.store.clone());
    net.connect(a.engine.self_address(), restarted.engine.self_address())
        .await;
    assert!(wait_until(WAIT, || restarted.engine.is_config_sync_complete()).await);

    let applied = restarted.callbacks.applied();
    assert!(applied.iter().all(|r| !r.is_reset()));
    assert!(applied.iter().any(|r| matches!(
        &r.event,
        ChangeEvent::DestinationUpdate { name, .. } if name == "prices"
    )));
    assert!(!applied.iter().any(|r| matches!(
        &r.event,
        ChangeEvent::DestinationUpdate { name, .. } if name == "orders"
    )));
}

#[tokio::test]
async fn test_master_leaving_fails_pending_change() {
    let net = MockNetwork::new();
    let (a, b) = synced_pair(&net).await;
    net.set_silent(a.engine.self_address(), true);

    let engine = b.engine.clone();
    let pending =
        tokio::spawn(async move { engine.record_config_change_event(destination("orders")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    net.disconnect(a.engine.self_address(), b.engine.self_address())
        .await;

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.status(), Status::Error, "{err}");
}

#[tokio::test]
async fn test_silent_master_times_out_change() {
    let net = MockNetwork::new();
    let (a, b) = synced_pair(&net).await;
    net.set_silent(a.engine.self_address(), true);

    let err = b
        .engine
        .record_config_change_event(destination("orders"))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Status::Timeout, "{err}");
    assert_eq!(b.engine.pending_config_change_events(), 0);
}

#[tokio::test]
async fn test_cancelled_change_leaves_no_waiter() {
    let net = MockNetwork::new();
    let (a, b) = synced_pair(&net).await;
    net.set_silent(a.engine.self_address(), true);

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        b.engine.record_unsubscribe("client-1", "durable-1"),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(b.engine.pending_config_change_events(), 0);
    assert_eq!(b.engine.config_op_in_progress_count(), 0);
}

#[tokio::test]
async fn test_master_store_failure_is_reported_to_follower() {
    let net = MockNetwork::new();
    let (a, b) = synced_pair(&net).await;
    a.store.fail_append(true);

    let err = b
        .engine
        .record_config_change_event(destination("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Reply { .. }), "{err}");
    assert!(a.store.records().is_empty());
}

#[tokio::test]
async fn test_failed_apply_leaves_sync_incomplete() {
    let net = MockNetwork::new();
    let a = broker(&net, "a", 1);
    a.engine.record_config_change_event(destination("orders")).await.unwrap();
    let b = broker(&net, "b", 2);
    b.callbacks.fail_apply(true);

    net.connect(a.engine.self_address(), b.engine.self_address())
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!b.engine.is_config_sync_complete());
    let err = b
        .engine
        .record_config_change_event(destination("prices"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::ConfigSyncIncomplete(_)), "{err}");
}
