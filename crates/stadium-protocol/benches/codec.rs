//! Codec benchmarks for stadium-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use stadium_protocol::codec;

const DEVICE_FRAME: &str = r#"{"topic":"fov-012","message":{"name":"fov-012","wifiConnected":true,"batteryCharge":87.0,"temperature":31.5,"latencyMs":42.0,"firmwareVersion":"1.4.2","otaStatus":"idle","lastMessageTime":"2025-05-01T18:22:10.123456","stadium":"anfield"}}"#;

const RELAY_FRAME: &str = r#"{"topic":"relay:championdata","message":{"alive":true,"last_seen":"2025-05-01T18:22:10Z"}}"#;

fn bench_decode_device(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(DEVICE_FRAME.len() as u64));
    group.bench_function("device_patch", |b| {
        b.iter(|| codec::decode(black_box(DEVICE_FRAME)))
    });
    group.finish();
}

fn bench_decode_relay(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(RELAY_FRAME.len() as u64));
    group.bench_function("relay_patch", |b| {
        b.iter(|| codec::decode(black_box(RELAY_FRAME)))
    });
    group.finish();
}

fn bench_keepalive(c: &mut Criterion) {
    c.bench_function("decode_ping", |b| b.iter(|| codec::decode(black_box("ping"))));
}

fn bench_roundtrip(c: &mut Criterion) {
    let frame = codec::decode(DEVICE_FRAME).unwrap();

    c.bench_function("roundtrip_device", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_decode_device,
    bench_decode_relay,
    bench_keepalive,
    bench_roundtrip
);
criterion_main!(benches);
