//! Codec benchmarks for roomcast-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use roomcast_protocol::{codec, ClientEvent, ServerEvent};
use serde_json::json;

fn bench_encode_count(c: &mut Criterion) {
    let event = ServerEvent::Count(42);

    let mut group = c.benchmark_group("encode_count");
    group.bench_function("json", |b| {
        b.iter(|| codec::encode_json(black_box(&event)))
    });
    group.bench_function("msgpack", |b| b.iter(|| codec::encode(black_box(&event))));
    group.finish();
}

fn bench_decode_message(c: &mut Criterion) {
    let event = ClientEvent::message(json!({"text": "a".repeat(256)}));
    let text = codec::encode_json(&event).unwrap();
    let binary = codec::encode(&event).unwrap();

    let mut group = c.benchmark_group("decode_message");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("json", |b| {
        b.iter(|| codec::decode_json::<ClientEvent>(black_box(&text)).unwrap())
    });
    group.throughput(Throughput::Bytes(binary.len() as u64));
    group.bench_function("msgpack", |b| {
        b.iter(|| codec::decode::<ClientEvent>(black_box(&binary)).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_encode_count, bench_decode_message);
criterion_main!(benches);
