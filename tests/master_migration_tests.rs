//! Master broker migration in a three broker non-HA cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use raptor_cluster::cluster::mock_transport::wait_until;
use raptor_cluster::cluster::{
    AddBrokerInfoResult, BrokerAddress, BrokerInfo, ChangeEvent, ClusterConfig, ClusterError,
    ClusterProfile, MemoryConfigStore, MockNetwork, PacketType, ProtocolEngine,
    RecordingCallbacks,
};

const WAIT: Duration = Duration::from_secs(3);

fn addr(id: &str, store_session: u64) -> BrokerAddress {
    BrokerAddress::new(id, format!("host-{id}"), 7676, store_session, 1).with_ha(false)
}

fn config() -> ClusterConfig {
    let mut config = ClusterConfig::from_profile(ClusterProfile::Testing);
    config.ha_enabled = false;
    config.master_broker = Some("a".to_string());
    config
}

struct Broker {
    engine: Arc<ProtocolEngine>,
    store: Arc<MemoryConfigStore>,
    callbacks: Arc<RecordingCallbacks>,
}

impl Broker {
    fn addr(&self) -> &BrokerAddress {
        self.engine.self_address()
    }
}

fn broker(net: &Arc<MockNetwork>, id: &str, store_session: u64) -> Broker {
    let store = Arc::new(MemoryConfigStore::new());
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = net.add_broker(config(), addr(id, store_session), store.clone(), callbacks.clone());
    Broker {
        engine,
        store,
        callbacks,
    }
}

async fn connect(net: &Arc<MockNetwork>, x: &Broker, y: &Broker) {
    let (rx, ry) = net.connect(x.addr(), y.addr()).await;
    assert_eq!(rx, AddBrokerInfoResult::Ok);
    assert_eq!(ry, AddBrokerInfoResult::Ok);
}

/// Master `a` with followers `b` and `c`, all synced and connected.
async fn setup(net: &Arc<MockNetwork>) -> (Broker, Broker, Broker) {
    let a = broker(net, "a", 1);
    let b = broker(net, "b", 2);
    let c = broker(net, "c", 3);

    a.engine
        .record_update_destination("queue", "orders", BTreeMap::new())
        .await
        .unwrap();
    a.engine
        .record_create_subscription("client-1", "audit", "orders")
        .await
        .unwrap();

    connect(net, &a, &b).await;
    connect(net, &a, &c).await;
    assert!(wait_until(WAIT, || b.engine.is_config_sync_complete()).await);
    assert!(wait_until(WAIT, || c.engine.is_config_sync_complete()).await);
    connect(net, &b, &c).await;
    (a, b, c)
}

#[tokio::test]
async fn test_migration_moves_change_log_and_role() {
    let net = MockNetwork::new();
    let (a, b, c) = setup(&net).await;

    a.engine.change_master_broker("b", Some("a")).await.unwrap();

    assert!(b.engine.is_master_broker());
    assert_eq!(a.engine.master_broker().as_ref(), Some(b.addr()));
    assert_eq!(c.engine.master_broker().as_ref(), Some(b.addr()));
    assert!(!a.engine.is_master_broker_blocked());
    assert_eq!(a.engine.config_op_in_progress_count(), 0);

    let shipped = b.store.records();
    assert_eq!(shipped.len(), 2);
    assert!(shipped.iter().all(|r| !r.is_reset()));
    assert!(shipped.iter().any(|r| matches!(
        &r.event,
        ChangeEvent::DestinationUpdate { name, .. } if name == "orders"
    )));

    assert!(
        b.callbacks
            .master_changes()
            .iter()
            .any(|(old, new)| old.as_ref() == Some(a.addr()) && new == b.addr())
    );
    assert!(
        c.callbacks
            .master_changes()
            .iter()
            .any(|(_, new)| new == b.addr())
    );
}

#[tokio::test]
async fn test_changes_after_migration_go_to_new_master() {
    let net = MockNetwork::new();
    let (a, b, c) = setup(&net).await;
    a.engine.change_master_broker("b", None).await.unwrap();
    let before_a = a.store.records().len();

    c.engine.record_unsubscribe("client-1", "audit").await.unwrap();
    a.engine.record_remove_destination("queue", "orders").await.unwrap();

    let records = b.store.records();
    assert_eq!(records.len(), 4);
    assert!(records.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(a.store.records().len(), before_a);
}

#[tokio::test]
async fn test_failed_commit_restores_old_master() {
    let net = MockNetwork::new();
    let (a, b, c) = setup(&net).await;
    net.drop_packets(b.addr(), PacketType::NewMasterBroker, true);

    let err = a.engine.change_master_broker("b", None).await.unwrap_err();
    assert!(matches!(err, ClusterError::Reply { .. }), "{err}");

    assert!(a.engine.is_master_broker());
    assert_eq!(a.engine.master_broker().as_ref(), Some(a.addr()));
    assert!(!a.engine.is_master_broker_blocked());
    assert_eq!(c.engine.master_broker().as_ref(), Some(a.addr()));
    assert_eq!(
        a.callbacks.master_changes().last(),
        Some(&(Some(b.addr().clone()), a.addr().clone()))
    );

    a.engine
        .record_update_destination("topic", "prices", BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(a.store.records().len(), 3);
}

#[tokio::test]
async fn test_migration_preconditions() {
    let net = MockNetwork::new();
    let (a, b, _c) = setup(&net).await;

    let err = a.engine.change_master_broker("", None).await.unwrap_err();
    assert!(matches!(err, ClusterError::InvalidArgument(_)), "{err}");

    let err = b.engine.change_master_broker("c", None).await.unwrap_err();
    assert!(matches!(err, ClusterError::NotMaster { ref master } if master == "a"), "{err}");

    let err = a.engine.change_master_broker("nobody", None).await.unwrap_err();
    assert!(matches!(err, ClusterError::Precondition(_)), "{err}");

    let err = a.engine.change_master_broker("b", Some("c")).await.unwrap_err();
    assert!(matches!(err, ClusterError::Precondition(_)), "{err}");

    a.engine.change_master_broker("a", None).await.unwrap();
    assert!(a.engine.is_master_broker());
    assert!(net.sent_of_type(PacketType::NewMasterBrokerPrepare).is_empty());
}

#[tokio::test]
async fn test_migration_refused_in_ha_mode() {
    let net = MockNetwork::new();
    let mut ha = config();
    ha.ha_enabled = true;
    let a = net.add_broker(
        ha,
        addr("a", 1).with_ha(true),
        Arc::new(MemoryConfigStore::new()),
        Arc::new(RecordingCallbacks::new()),
    );

    let err = a.change_master_broker("b", None).await.unwrap_err();
    assert!(matches!(err, ClusterError::Precondition(_)), "{err}");
}

#[tokio::test]
async fn test_migration_refused_to_old_protocol_version() {
    let net = MockNetwork::new();
    let a = broker(&net, "a", 1);
    let old = broker(&net, "old", 2);
    net.set_broker_info(BrokerInfo::new(old.addr().clone(), 450));
    connect(&net, &a, &old).await;

    let err = a.engine.change_master_broker("old", None).await.unwrap_err();
    assert!(matches!(err, ClusterError::Precondition(_)), "{err}");
    assert!(a.engine.is_master_broker());
}
