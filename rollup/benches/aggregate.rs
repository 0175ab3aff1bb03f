//! Microbenchmarks for the aggregation hot path.
//!
//! Measures merge cost in memory, key encoding, and durable ingest through
//! the aggregator.
//!
//! Run with: `cargo bench -p rollup -- aggregate`

#![allow(missing_docs, clippy::cast_possible_truncation)]

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rollup::clock::ManualClock;
use rollup::config::{AggregatorConfig, HistogramConfig};
use rollup::event::{ApmEvent, Outcome};
use rollup::key::{AggregationKey, KeyPart, PartKind};
use rollup::store::BufferStore;
use rollup::telemetry::AggregatorMetrics;
use rollup::value::MetricValue;
use rollup::Aggregator;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const BASE: u64 = 1_700_000_040_000_000_000;

/// Creates an aggregator whose clock never leaves the first window.
fn setup_aggregator() -> (Aggregator, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let config = AggregatorConfig::default();
    let store = Arc::new(BufferStore::open(temp_dir.path().join("bench_store"), &config).unwrap());
    let aggregator = Aggregator::new(
        config,
        store,
        Arc::new(ManualClock::new(BASE)),
        AggregatorMetrics::new().unwrap(),
    )
    .unwrap();
    (aggregator, temp_dir)
}

fn events(count: usize, services: usize) -> Vec<ApmEvent> {
    (0..count)
        .map(|i| {
            ApmEvent::transaction(
                BASE + i as u64,
                format!("service-{}", i % services),
                "request",
                format!("GET /route/{}", i % 64),
                100 + (i as u64 * 37) % 50_000,
                Outcome::Success,
            )
        })
        .collect()
}

fn bench_value_merge(c: &mut Criterion) {
    let histogram = HistogramConfig::default();
    let samples: Vec<MetricValue> = events(1024, 1)
        .iter()
        .map(|e| MetricValue::from_event(e, &histogram))
        .collect();

    c.bench_function("value/merge", |b| {
        let mut acc = samples[0].clone();
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % samples.len();
            acc.merge(black_box(&samples[i])).unwrap();
        });
    });

    let mut populated = samples[0].clone();
    for sample in &samples[1..] {
        populated.merge(sample).unwrap();
    }
    c.bench_function("value/encode_decode", |b| {
        b.iter(|| {
            let bytes = black_box(&populated).encode();
            MetricValue::decode(black_box(&bytes)).unwrap()
        });
    });
}

fn bench_key_codec(c: &mut Criterion) {
    let key = AggregationKey::global(60_000, BASE)
        .child(KeyPart::named(PartKind::Service, "checkout-api"), 0)
        .unwrap()
        .child(KeyPart::named(PartKind::TransactionType, "request"), 0)
        .unwrap()
        .child(KeyPart::named(PartKind::TransactionName, "POST /pay"), 0)
        .unwrap();
    let mut buf = Vec::with_capacity(64);

    c.bench_function("key/encode", |b| {
        b.iter(|| {
            buf.clear();
            black_box(&key).encode_into(&mut buf);
        });
    });

    let bytes = key.encode();
    c.bench_function("key/decode", |b| {
        b.iter(|| AggregationKey::decode(black_box(&bytes)).unwrap());
    });
}

fn bench_add(c: &mut Criterion) {
    let (aggregator, _dir) = setup_aggregator();
    let sample = events(1, 1).remove(0);

    c.bench_function("aggregate/add_durable", |b| {
        b.iter(|| aggregator.add(black_box(&sample)).unwrap());
    });
}

fn bench_add_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate/add_batch");
    let cancel = CancellationToken::new();

    for size in [10, 100, 1000] {
        let (aggregator, _dir) = setup_aggregator();
        let batch = events(size, 8);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let report = aggregator.add_batch(black_box(&batch), &cancel).unwrap();
                assert_eq!(report.accepted, size);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_value_merge,
    bench_key_codec,
    bench_add,
    bench_add_batch,
);
criterion_main!(benches);
