//! Cluster coordination core.
//!
//! One [`ProtocolEngine`] runs inside every broker of a multi-broker
//! message queue and keeps the brokers agreeing on who owns what:
//!
//! - **Resource election**: exclusive and shared locks on queues, client
//!   ids and durable subscriptions, decided by a vote of every live broker
//! - **Store session takeover**: HA failover of a dead broker's store,
//!   fencing the old incarnation off before the taker serves it
//! - **Master broker**: the config server that keeps the change log of
//!   destinations and durable subscriptions, and its two-phase migration
//! - **Membership**: admission, goodbye and removal of peers
//!
//! # Architecture
//!
//! ```text
//!        ┌──────────────────────────────────────────────┐
//!        │               ProtocolEngine                 │
//!        │                                              │
//!        │  BrokerList   ResourceTable   TakeoverCache  │
//!        │  ReplyTracker x5   EventLogWaiters           │
//!        │  MigrationBlock   config server              │
//!        └───────┬──────────────┬───────────────┬───────┘
//!                │              │               │
//!          ┌─────▼─────┐ ┌──────▼──────┐ ┌──────▼────────┐
//!          │ Transport │ │ ConfigChange│ │ BrokerCallbacks│
//!          │ (links)   │ │ Store (log) │ │ (broker hooks) │
//!          └───────────┘ └─────────────┘ └────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use raptor_cluster::cluster::{
//!     BrokerAddress, ClusterConfig, MemoryConfigStore, MockNetwork, RecordingCallbacks,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let net = MockNetwork::new();
//!     let engine = net.add_broker(
//!         ClusterConfig::from_env(),
//!         BrokerAddress::new("broker-a", "localhost", 7676, 1, 1),
//!         Arc::new(MemoryConfigStore::new()),
//!         Arc::new(RecordingCallbacks::new()),
//!     );
//!     let status = engine.lock_resource("queue:orders", 0, "consumer-1").await;
//!     println!("lock: {}", status);
//! }
//! ```

pub mod address;
pub mod change_record;
pub mod config;
mod engine;
pub mod error;
pub mod event_log;
pub mod master;
pub mod membership;
pub mod metrics;
pub mod packet;
pub mod reply;
pub mod reply_tracker;
pub mod resource;
pub mod retry;
pub mod status;
pub mod takeover;
pub mod transport;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock_transport;

pub use address::{BrokerAddress, BrokerInfo};
pub use change_record::{ChangeEvent, ChangeRecord};
pub use config::{ClusterConfig, ClusterProfile};
pub use engine::ProtocolEngine;
pub use error::{ClusterError, ClusterResult};
pub use membership::{AddBrokerInfoResult, BrokerInfoEx};
pub use packet::{ClusterPacket, PacketType, PropValue};
pub use reply::{ReplyStatus, ReplyWaiter, WaitStatus, WaiterKind};
pub use reply_tracker::ReplyTracker;
pub use resource::LockState;
pub use status::{LockStatus, Status};
pub use takeover::{TakeoverInfo, TakeoverKey, TakingoverEntry};
pub use transport::{BrokerCallbacks, ConfigChangeStore, LinkId, Transport};

#[cfg(any(test, feature = "test-utilities"))]
pub use mock_transport::{MemoryConfigStore, MockNetwork, RecordingCallbacks};
