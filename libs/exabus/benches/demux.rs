//! Event routing throughput
//!
//! Measures the per-event cost of shard selection and demultiplexing, and of
//! the queueing collector's add/poll path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use exabus::{BufferSequence, DemultiplexingCollector, EndPoint, Event, EventCollector, QueueingEventCollector, Shard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shard that counts and drops events
#[derive(Default)]
struct CountingShard {
    events: AtomicU64,
}

impl Shard for CountingShard {
    fn add(&self, event: Event) -> bool {
        self.events.fetch_add(1, Ordering::Relaxed);
        drop(event);
        false
    }
}

fn endpoints(count: usize) -> Vec<EndPoint> {
    (0..count)
        .map(|i| EndPoint::new("lb", format!("peer-{}", i), None))
        .collect()
}

fn bench_shard_selection(c: &mut Criterion) {
    let eps = endpoints(64);

    c.bench_function("shard_of", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % eps.len();
            black_box(EndPoint::shard_of(Some(black_box(&eps[i])), 8))
        });
    });
}

fn bench_demultiplex(c: &mut Criterion) {
    let mut group = c.benchmark_group("demultiplex");
    group.throughput(Throughput::Elements(1));
    let eps = endpoints(50);
    let payload = bytes::Bytes::from(vec![0u8; 64]);

    for shards in [1usize, 4, 16] {
        let collector =
            DemultiplexingCollector::new((0..shards).map(|_| Arc::new(CountingShard::default())).collect()).unwrap();

        group.bench_with_input(BenchmarkId::new("message", shards), &shards, |b, _| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % eps.len();
                let event = Event::message(eps[i].clone(), BufferSequence::from_bytes(payload.clone()));
                collector.add(black_box(event));
            });
        });
    }

    group.finish();
}

fn bench_queueing(c: &mut Criterion) {
    let collector = QueueingEventCollector::new();
    let peer = EndPoint::new("lb", "peer", None);

    c.bench_function("queue_add_poll", |b| {
        b.iter(|| {
            collector.add(Event::new(exabus::EventType::Connect, Some(peer.clone())));
            black_box(collector.poll_timeout(Some(Duration::ZERO)).unwrap())
        });
    });
}

criterion_group!(benches, bench_shard_selection, bench_demultiplex, bench_queueing);
criterion_main!(benches);
