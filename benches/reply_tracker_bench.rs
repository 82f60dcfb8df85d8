//! Criterion micro-benchmarks for the reply path.
//!
//! Measures:
//! - Xid allocation
//! - Register, notify and wait on a [`ReplyTracker`]
//! - Change log compaction before a config sync
//!
//! Run with: `cargo bench --bench reply_tracker_bench`

use std::collections::BTreeMap;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use raptor_cluster::cluster::change_record::{ChangeEvent, ChangeRecord, compress};
use raptor_cluster::cluster::reply_tracker::next_xid;
use raptor_cluster::cluster::{BrokerAddress, ClusterPacket, PacketType, ReplyTracker, ReplyWaiter};

fn bench_xid(c: &mut Criterion) {
    c.bench_function("next_xid", |b| b.iter(|| black_box(next_xid())));
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("tokio runtime");
    let tracker = ReplyTracker::new("bench");
    let peer = BrokerAddress::new("b", "host-b", 7676, 1, 1);
    let reply = ClusterPacket::new(PacketType::NewMasterBrokerReply);

    c.bench_function("tracker_round_trip", |b| {
        b.to_async(&rt).iter(|| async {
            let xid = tracker.add_waiter(ReplyWaiter::unicast(
                peer.clone(),
                PacketType::NewMasterBrokerReply,
            ));
            tracker.notify_reply(xid, &peer, reply.clone());
            black_box(tracker.wait_for_reply(xid, Duration::from_secs(1)).await)
        });
    });
}

fn change_log(len: usize) -> Vec<ChangeRecord> {
    (0..len)
        .map(|i| {
            let name = format!("queue-{}", i % 64);
            let event = if i % 5 == 4 {
                ChangeEvent::DestinationRemove {
                    dest_type: "queue".to_string(),
                    name,
                }
            } else {
                ChangeEvent::DestinationUpdate {
                    dest_type: "queue".to_string(),
                    name,
                    attrs: BTreeMap::new(),
                }
            };
            ChangeRecord {
                timestamp: i as i64,
                ..ChangeRecord::new(event)
            }
        })
        .collect()
}

fn bench_compress(c: &mut Criterion) {
    let mut group = c.benchmark_group("compress");
    for len in [100, 1_000, 10_000] {
        let records = change_log(len);
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &records, |b, records| {
            b.iter(|| compress(black_box(records)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_xid, bench_round_trip, bench_compress);
criterion_main!(benches);
