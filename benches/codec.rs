// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Frame codec benchmarks.
//
// Run with:
//   cargo bench --bench codec
//
// Groups:
//   request_encode   header + payload into a region-sized buffer
//   request_decode   header parse + payload copy out of the region
//   response_encode  same for response frames
//   response_decode  same for response frames
//   chain_payload    call table to JSON bytes
//
// Payload sizes:
//   small   64 bytes (typical CALL)
//   medium  1024 bytes
//   large   8192 bytes (close to the 10 KiB request ceiling)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use capipc::chain::DeferredValue;
use capipc::codec::{encode_payload, Command, RequestFrame, ResponseFrame};
use capipc::config::{REQUEST_CAPACITY, RESPONSE_CAPACITY};
use capipc::TypeSpec;

const SIZES: &[(&str, usize)] = &[("small_64", 64), ("medium_1024", 1024), ("large_8192", 8192)];

fn bench_request(c: &mut Criterion) {
    let mut enc = c.benchmark_group("request_encode");
    for &(label, size) in SIZES {
        let frame = RequestFrame {
            sequence: 42,
            command: Command::Call,
            payload: vec![b'x'; size],
        };
        let mut region = vec![0u8; 8 + REQUEST_CAPACITY];
        enc.throughput(Throughput::Bytes(size as u64));
        enc.bench_with_input(BenchmarkId::from_parameter(label), &frame, |b, f| {
            b.iter(|| black_box(f.encode_into(&mut region, REQUEST_CAPACITY).ok()));
        });
    }
    enc.finish();

    let mut dec = c.benchmark_group("request_decode");
    for &(label, size) in SIZES {
        let bytes = RequestFrame {
            sequence: 42,
            command: Command::Call,
            payload: vec![b'x'; size],
        }
        .encode(REQUEST_CAPACITY)
        .unwrap_or_default();
        dec.throughput(Throughput::Bytes(size as u64));
        dec.bench_with_input(BenchmarkId::from_parameter(label), &bytes, |b, buf| {
            b.iter(|| black_box(RequestFrame::decode(buf).ok()));
        });
    }
    dec.finish();
}

fn bench_response(c: &mut Criterion) {
    let mut enc = c.benchmark_group("response_encode");
    for &(label, size) in SIZES {
        let frame = ResponseFrame {
            sequence: 42,
            payload: vec![b'x'; size],
        };
        let mut region = vec![0u8; 8 + RESPONSE_CAPACITY];
        enc.throughput(Throughput::Bytes(size as u64));
        enc.bench_with_input(BenchmarkId::from_parameter(label), &frame, |b, f| {
            b.iter(|| black_box(f.encode_into(&mut region, RESPONSE_CAPACITY).ok()));
        });
    }
    enc.finish();

    let mut dec = c.benchmark_group("response_decode");
    for &(label, size) in SIZES {
        let bytes = ResponseFrame {
            sequence: 42,
            payload: vec![b'x'; size],
        }
        .encode(RESPONSE_CAPACITY)
        .unwrap_or_default();
        dec.throughput(Throughput::Bytes(size as u64));
        dec.bench_with_input(BenchmarkId::from_parameter(label), &bytes, |b, buf| {
            b.iter(|| black_box(ResponseFrame::decode(buf).ok()));
        });
    }
    dec.finish();
}

fn bench_chain_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_payload");
    for steps in [1usize, 4, 16] {
        let mut value = DeferredValue::from_call("sig", "step", TypeSpec::Any, vec![json!(0).into()]);
        for i in 1..steps {
            value = DeferredValue::from_call("sig", "step", TypeSpec::Any, vec![value.into(), json!(i).into()]);
        }
        group.bench_with_input(BenchmarkId::from_parameter(steps), &value, |b, v| {
            b.iter(|| black_box(encode_payload(&v.table().to_payload()).ok()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_request, bench_response, bench_chain_payload);
criterion_main!(benches);
