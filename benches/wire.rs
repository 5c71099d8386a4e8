//! Benchmarks for the frame codec.
//!
//! The codec sits on every request and every WebSocket message, so
//! per-frame overhead is worth watching.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use membrane::protocol::message::{self, RequestHeaders};
use membrane::protocol::wire::{self, Frame, TYPE_RESPONSE};
use std::collections::HashMap;

fn control_frame_roundtrip(c: &mut Criterion) {
    let frame = Frame::worker_ready();
    c.bench_function("encode_control_frame", |b| {
        b.iter(|| wire::encode_vec(black_box(&frame)).unwrap())
    });

    let encoded = wire::encode_vec(&frame).unwrap();
    c.bench_function("decode_control_frame", |b| {
        b.iter(|| wire::decode_slice(black_box(&encoded)).unwrap())
    });
}

fn request_frame_roundtrip(c: &mut Criterion) {
    let headers = RequestHeaders {
        method: "POST".to_string(),
        uri: "/api/v2/orders".to_string(),
        query_string: "expand=items&currency=EUR".to_string(),
        headers: HashMap::from([
            ("Host".to_string(), "shop.example.com".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
            ("Cookie".to_string(), "session=7f3a2b1c; theme=dark".to_string()),
            ("User-Agent".to_string(), "Mozilla/5.0".to_string()),
        ]),
        remote_addr: "203.0.113.9:54012".to_string(),
        server_name: "shop.example.com".to_string(),
        server_port: "443".to_string(),
        protocol: "HTTP/1.1".to_string(),
    };
    let body = vec![0x7Bu8; 16 * 1024];

    let mut group = c.benchmark_group("request_frame");
    group.throughput(Throughput::Bytes(16 * 1024));
    group.bench_function("encode_16k", |b| {
        b.iter(|| {
            let frame = message::encode_request(black_box(&headers), body.clone()).unwrap();
            wire::encode_vec(&frame).unwrap()
        })
    });

    let frame = message::encode_request(&headers, body).unwrap();
    let encoded = wire::encode_vec(&frame).unwrap();
    group.bench_function("decode_16k", |b| {
        b.iter(|| {
            let frame = wire::decode_slice(black_box(&encoded)).unwrap();
            assert_eq!(frame.frame_type, wire::TYPE_REQUEST);
            frame
        })
    });
    group.finish();
}

fn response_payload_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_payload");
    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let frame = Frame {
            frame_type: TYPE_RESPONSE,
            payload: vec![0xA5; size],
            ..Frame::default()
        };
        let encoded = wire::encode_vec(&frame).unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("decode_{}", size), |b| {
            b.iter(|| wire::decode_slice(black_box(&encoded)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    control_frame_roundtrip,
    request_frame_roundtrip,
    response_payload_scaling
);
criterion_main!(benches);
