//! Performance benchmarks for delta encoding and token bookkeeping.
//!
//! Run with: cargo bench

use std::sync::Arc;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};

use quote_relay::domain::{DeltaRecord, DocumentMeta, SERVER_ACTOR};
use quote_relay::infra::encoder::{tag_payload, CborCodec, DeltaEncoder, PayloadCodec, ProgramInfo};
use quote_relay::infra::{MemoryTokenDao, RandomTokenIdGenerator, TokenStore};
use quote_relay::{DeltaKind, DocumentId, TokenNamespace};

/// Bucket with `drivers` nested driver records
fn bucket(drivers: usize) -> Value {
    let drivers: Vec<Value> = (0..drivers)
        .map(|i| {
            json!({
                "name": format!("driver-{i}"),
                "age": 30 + i,
                "licensed": true,
                "violations": [{"code": "SP", "points": 2}, null],
                "__internal": {"rev": i}
            })
        })
        .collect();

    json!({
        "zip": "12345",
        "state": "OH",
        "vehicles": [{"vin": "1HGCM82633A004352", "year": 2019, "garaged": null}],
        "drivers": drivers,
    })
}

fn record(bucket: Value) -> DeltaRecord {
    let now = Utc::now();
    DeltaRecord {
        kind: DeltaKind::data(),
        timestamp: now,
        actor: SERVER_ACTOR.to_string(),
        step: None,
        meta: DocumentMeta::new(DocumentId::new(1000), now, now),
        delta: json!({"zip": "12345"}),
        bucket,
        ratedata: None,
    }
}

/// Benchmark union tagging
fn bench_tagging(c: &mut Criterion) {
    let mut group = c.benchmark_group("tagging");

    for drivers in [1, 10, 100].iter() {
        let payload = bucket(*drivers);
        group.throughput(Throughput::Elements(*drivers as u64));
        group.bench_with_input(BenchmarkId::new("tag_payload", drivers), &payload, |b, payload| {
            b.iter(|| black_box(tag_payload(payload)));
        });
    }

    group.finish();
}

/// Benchmark CBOR encoding of tagged payloads
fn bench_cbor(c: &mut Criterion) {
    let tagged = tag_payload(&bucket(10));

    c.bench_function("cbor_encode_10_drivers", |b| {
        b.iter(|| black_box(CborCodec.encode(&tagged).unwrap()));
    });
}

/// Benchmark the full encode path: tag, envelope, validate, encode
fn bench_full_encode(c: &mut Criterion) {
    let encoder = DeltaEncoder::with_bundled_schema(ProgramInfo::new("bench", "1.0.0")).unwrap();
    let mut group = c.benchmark_group("delta_encode");

    for drivers in [1, 10, 100].iter() {
        let rec = record(bucket(*drivers));
        group.bench_with_input(BenchmarkId::new("encode", drivers), &rec, |b, rec| {
            b.iter(|| black_box(encoder.encode(rec).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark a full token lifecycle against the in-memory DAO
fn bench_token_lifecycle(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let store = TokenStore::new(
        Arc::new(MemoryTokenDao::new()),
        DocumentId::new(1000),
        TokenNamespace::from("loc"),
        Arc::new(RandomTokenIdGenerator),
    );

    c.bench_function("token_create_complete_accept", |b| {
        b.to_async(&runtime).iter(|| async {
            let token = store.create_token().await.unwrap();
            let done = store.complete_token(&token, None).await.unwrap();
            black_box(store.accept_token(&done, None).await.unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_tagging,
    bench_cbor,
    bench_full_encode,
    bench_token_lifecycle
);
criterion_main!(benches);
