//! # Raptor Cluster
//! Cluster coordination core for a multi-broker message queue.
//!
//! Brokers of a cluster use this crate to agree on:
//! - which broker owns a queue, client id or durable subscription
//!   (resource election)
//! - which broker serves a failed broker's store session (HA takeover)
//! - which broker is the master broker keeping the cluster config, and how
//!   the role moves (master broker migration)
//!
//! The crate does not open sockets or persist data. The embedding broker
//! supplies a [`Transport`](cluster::Transport), a
//! [`ConfigChangeStore`](cluster::ConfigChangeStore) and
//! [`BrokerCallbacks`](cluster::BrokerCallbacks), and feeds inbound packets to
//! [`ProtocolEngine::handle_packet`](cluster::ProtocolEngine::handle_packet).
//!
//! ## Getting started
//! ```toml
//! raptor-cluster = "0.1"
//! ```
//!
//! ```rust,ignore
//! use raptor_cluster::prelude::*;
//!
//! async fn claim(engine: &ProtocolEngine) {
//!     match engine.lock_resource("queue:orders", 0, "consumer-1").await {
//!         LockStatus::Success => println!("serving queue:orders"),
//!         other => println!("not ours: {}", other),
//!     }
//! }
//! ```
//!
//! ## Testing
//! The `test-utilities` feature exposes
//! [`MockNetwork`](cluster::mock_transport::MockNetwork), an in-memory
//! cluster wiring any number of engines together.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod constants;
pub mod telemetry;

pub mod prelude {
    //! Types most embedders need.
    pub use crate::cluster::{
        AddBrokerInfoResult, BrokerAddress, BrokerCallbacks, BrokerInfo, ChangeEvent,
        ChangeRecord, ClusterConfig, ClusterError, ClusterPacket, ClusterProfile, ClusterResult,
        ConfigChangeStore, LockStatus, PacketType, ProtocolEngine, Status, TakeoverKey, Transport,
    };

    pub use bytes;
}
