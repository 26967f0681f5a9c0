//! Benchmarks for hub fan-out and the SQLite event store
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use eventhub::store::{Event, EventStore, SqliteEventStore};
use eventhub::websocket::{ConnectionHub, HubConfig, ServerMessage};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::runtime::Runtime;

fn sample_event(i: usize) -> Event {
    Event::new("bench_event", "bench").payload(serde_json::json!({ "seq": i, "user": "u-1" }))
}

/// Hub with `sessions` connections whose sinks discard everything
fn hub_with_sessions(rt: &Runtime, sessions: usize) -> Arc<ConnectionHub> {
    let hub = Arc::new(ConnectionHub::new(HubConfig {
        max_connections: sessions + 1,
        ..HubConfig::default()
    }));

    rt.block_on(async {
        for i in 0..sessions {
            hub.register(
                format!("user-{}", i),
                futures_util::sink::drain(),
                futures_util::stream::pending::<Result<axum::extract::ws::Message, String>>(),
            )
            .await
            .unwrap();
        }
    });

    hub
}

fn bench_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("broadcast");

    for sessions in [10, 100, 500] {
        let hub = hub_with_sessions(&rt, sessions);
        let message = ServerMessage::Event(sample_event(0));

        group.throughput(Throughput::Elements(sessions as u64));
        group.bench_function(format!("to_all_{}", sessions), |b| {
            b.iter(|| rt.block_on(hub.broadcast_to_all(black_box(&message))))
        });

        rt.block_on(hub.shutdown());
    }

    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("store");

    group.bench_function("insert_single", |b| {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open(&dir.path().join("bench.db")).unwrap();
        let mut i = 0;

        b.iter(|| {
            i += 1;
            rt.block_on(store.insert(black_box(&sample_event(i)))).unwrap()
        });
    });

    group.throughput(Throughput::Elements(100));
    group.bench_function("insert_batch_100", |b| {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open(&dir.path().join("bench.db")).unwrap();

        b.iter(|| {
            let events: Vec<Event> = (0..100).map(sample_event).collect();
            rt.block_on(store.insert_batch(black_box(&events))).unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_broadcast, bench_store);
criterion_main!(benches);
