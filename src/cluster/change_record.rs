//! Config change records.
//!
//! The master broker keeps a totally ordered log of destination and durable
//! subscription changes. Brokers replay it on config sync, and master
//! migration ships a compacted copy of it to the new master.
//!
//! # Compaction
//!
//! Only the latest record per [`unique_key`](ChangeRecord::unique_key)
//! matters, and only when that record adds something. A destination that was
//! created and later removed leaves no trace in the compacted log.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::ClusterResult;

/// One change to cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// Marks the start of a replayed log; the receiver clears its store.
    Reset,
    DestinationUpdate {
        dest_type: String,
        name: String,
        #[serde(default)]
        attrs: BTreeMap<String, String>,
    },
    DestinationRemove {
        dest_type: String,
        name: String,
    },
    SubscriptionCreate {
        client_id: String,
        name: String,
        dest: String,
    },
    Unsubscribe {
        client_id: String,
        name: String,
    },
}

/// A change event stamped by the master broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Master broker time the record was appended, in millis.
    pub timestamp: i64,
    /// Migration uuid, set on records shipped by a master migration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub event: ChangeEvent,
}

impl ChangeRecord {
    pub fn new(event: ChangeEvent) -> Self {
        Self {
            timestamp: 0,
            uuid: None,
            event,
        }
    }

    pub fn reset() -> Self {
        Self::new(ChangeEvent::Reset)
    }

    pub fn is_reset(&self) -> bool {
        matches!(self.event, ChangeEvent::Reset)
    }

    /// Identity of the object the record changes.
    pub fn unique_key(&self) -> String {
        match &self.event {
            ChangeEvent::Reset => "reset".to_string(),
            ChangeEvent::DestinationUpdate {
                dest_type, name, ..
            }
            | ChangeEvent::DestinationRemove { dest_type, name } => {
                format!("dst:{}:{}", dest_type, name)
            }
            ChangeEvent::SubscriptionCreate {
                client_id, name, ..
            }
            | ChangeEvent::Unsubscribe { client_id, name } => {
                format!("dur:{}:{}", client_id, name)
            }
        }
    }

    /// True if the record creates or updates its object.
    pub fn is_add_op(&self) -> bool {
        matches!(
            self.event,
            ChangeEvent::DestinationUpdate { .. } | ChangeEvent::SubscriptionCreate { .. }
        )
    }
}

impl std::fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} @{}]", self.unique_key(), self.timestamp)
    }
}

/// Keep only the last record per object, and only if it adds the object.
///
/// Surviving records keep their relative order.
pub fn compress(records: &[ChangeRecord]) -> Vec<ChangeRecord> {
    let mut last: HashMap<String, usize> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        last.insert(record.unique_key(), i);
    }
    records
        .iter()
        .enumerate()
        .filter(|(i, r)| r.is_add_op() && last.get(&r.unique_key()) == Some(i))
        .map(|(_, r)| r.clone())
        .collect()
}

/// Serialize records as a packet payload.
pub fn encode_records(records: &[ChangeRecord]) -> ClusterResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(records)?))
}

pub fn decode_records(payload: &[u8]) -> ClusterResult<Vec<ChangeRecord>> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(name: &str) -> ChangeRecord {
        ChangeRecord::new(ChangeEvent::DestinationUpdate {
            dest_type: "queue".into(),
            name: name.into(),
            attrs: BTreeMap::new(),
        })
    }

    fn dest_removed(name: &str) -> ChangeRecord {
        ChangeRecord::new(ChangeEvent::DestinationRemove {
            dest_type: "queue".into(),
            name: name.into(),
        })
    }

    fn durable(client: &str, name: &str) -> ChangeRecord {
        ChangeRecord::new(ChangeEvent::SubscriptionCreate {
            client_id: client.into(),
            name: name.into(),
            dest: "topic.t".into(),
        })
    }

    #[test]
    fn test_unique_keys() {
        assert_eq!(dest("q1").unique_key(), "dst:queue:q1");
        assert_eq!(dest_removed("q1").unique_key(), "dst:queue:q1");
        assert_eq!(durable("c", "d").unique_key(), "dur:c:d");
        let unsub = ChangeRecord::new(ChangeEvent::Unsubscribe {
            client_id: "c".into(),
            name: "d".into(),
        });
        assert_eq!(unsub.unique_key(), "dur:c:d");
        assert!(!unsub.is_add_op());
    }

    #[test]
    fn test_compress_drops_removed_and_superseded() {
        let mut updated = dest("q1");
        if let ChangeEvent::DestinationUpdate { attrs, .. } = &mut updated.event {
            attrs.insert("maxCount".into(), "10".into());
        }
        let records = vec![
            dest("q1"),
            durable("c", "d"),
            dest("q2"),
            dest_removed("q2"),
            updated.clone(),
        ];
        let compressed = compress(&records);
        assert_eq!(compressed, vec![durable("c", "d"), updated]);
    }

    #[test]
    fn test_compress_keeps_recreated() {
        let records = vec![dest("q1"), dest_removed("q1"), dest("q1")];
        assert_eq!(compress(&records).len(), 1);
    }

    #[test]
    fn test_payload_roundtrip_keeps_reset_first() {
        let mut records = vec![ChangeRecord::reset()];
        records.extend(compress(&[dest("q1"), durable("c", "d")]));
        let decoded = decode_records(&encode_records(&records).unwrap()).unwrap();
        assert!(decoded[0].is_reset());
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_records(b"{not json").is_err());
    }
}
