//! TCP reassembly benchmarks.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sentry_common::FlowKey;
use sentry_reassembly::{ConnectionPool, PayloadPool, TcpReassembler, TcpSegment};
use tokio::runtime::Runtime;

fn flow(src_port: u16) -> FlowKey {
    FlowKey::new(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        src_port,
        443,
        6,
    )
}

fn segment(flow: FlowKey, seq: u32, payload: &[u8], syn: bool, fin: bool) -> TcpSegment {
    TcpSegment {
        flow,
        seq,
        syn,
        ack: !syn,
        fin,
        rst: false,
        payload: payload.to_vec(),
        timestamp: Utc::now(),
    }
}

fn bench_in_order_stream(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("tcp_reassembly");
    group.throughput(Throughput::Elements(100));

    group.bench_function("100_in_order_segments", |b| {
        b.iter(|| {
            rt.block_on(async {
                let pool = ConnectionPool::new(16);
                let payloads = PayloadPool::new(16);
                let (reassembler, mut output) =
                    TcpReassembler::new(16, Duration::from_secs(300), pool, payloads);
                let flow = flow(12345);

                reassembler.assemble(segment(flow, 0, b"", true, false)).await;
                for i in 0..100u32 {
                    let seg = segment(flow, 1 + i * 8, b"payload!", false, false);
                    reassembler.assemble(seg).await;
                }
                reassembler.assemble(segment(flow, 1 + 100 * 8, b"", false, true)).await;

                black_box(output.try_recv().ok())
            })
        })
    });
    group.finish();
}

fn bench_out_of_order_stream(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    c.bench_function("tcp_reassembly_out_of_order", |b| {
        b.iter(|| {
            rt.block_on(async {
                let pool = ConnectionPool::new(16);
                let payloads = PayloadPool::new(16);
                let (reassembler, mut output) =
                    TcpReassembler::new(16, Duration::from_secs(300), pool, payloads);
                let flow = flow(54321);

                reassembler.assemble(segment(flow, 0, b"", true, false)).await;
                // Reverse order: worst case for the out-of-order page map.
                for i in (0..50u32).rev() {
                    let seg = segment(flow, 1 + i * 8, b"payload!", false, false);
                    reassembler.assemble(seg).await;
                }
                reassembler.assemble(segment(flow, 1 + 50 * 8, b"", false, true)).await;

                black_box(output.try_recv().ok())
            })
        })
    });
}

criterion_group!(benches, bench_in_order_stream, bench_out_of_order_stream);
criterion_main!(benches);
