//! Performance benchmarks for the per-record hot path.
//!
//! Measures partition selection and record batch encoding and decoding.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use kafka_mtls_core::producer::partitioner::murmur2;
use kafka_mtls_core::producer::Partitioner;
use kafka_mtls_core::protocol::records::{assign_offsets, decode_record_set, encode_batch, OutgoingRecord};

fn records(count: usize, value_size: usize) -> Vec<OutgoingRecord> {
    (0..count)
        .map(|i| OutgoingRecord {
            key: Some(Bytes::from(format!("key-{i}"))),
            value: Some(Bytes::from(vec![b'x'; value_size])),
            timestamp: 1_700_000_000_000 + i as i64,
        })
        .collect()
}

/// Benchmark murmur2 over typical key lengths.
fn bench_murmur2(c: &mut Criterion) {
    let mut group = c.benchmark_group("murmur2");

    for len in [8usize, 36, 256] {
        let key = vec![b'k'; len];
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &key, |b, key| {
            b.iter(|| black_box(murmur2(black_box(key))));
        });
    }

    group.finish();
}

/// Benchmark keyed and keyless partition selection.
fn bench_partitioner(c: &mut Criterion) {
    let mut group = c.benchmark_group("partitioner");
    let partitioner = Partitioner::new();

    group.throughput(Throughput::Elements(1));
    group.bench_function("keyed", |b| {
        b.iter(|| black_box(partitioner.partition(Some(&b"customer-42"[..]), None, 12)));
    });
    group.bench_function("keyless", |b| {
        b.iter(|| black_box(partitioner.partition(None, None, 12)));
    });

    group.finish();
}

/// Benchmark encoding a produce batch.
fn bench_encode_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_batch");

    for (count, value_size) in [(1, 100), (100, 100), (100, 1024)] {
        let batch = records(count, value_size);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::new("records", format!("{count}x{value_size}B")),
            &batch,
            |b, batch| {
                b.iter(|| black_box(encode_batch(batch).unwrap()));
            },
        );
    }

    group.finish();
}

/// Benchmark decoding a fetched record set.
fn bench_decode_record_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_record_set");

    for count in [1usize, 100] {
        let encoded = encode_batch(&records(count, 100)).unwrap();
        let (stored, _) = assign_offsets(&encoded, 0).unwrap();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &stored, |b, stored| {
            b.iter(|| black_box(decode_record_set(stored.clone()).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_murmur2,
    bench_partitioner,
    bench_encode_batch,
    bench_decode_record_set,
);

criterion_main!(benches);
