//! Homa ping-pong benchmark.
//!
//! Measures request/response round-trip latency over the in-memory
//! loopback driver for small and multi-packet payloads.
//!
//! Run with:
//! ```bash
//! cargo bench --package homa --bench pingpong
//! ```

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use homa::{LoopbackNetwork, OpState, Transport, TransportConfig};

const SMALL_MSG_SIZE: usize = 32;
// Several loopback packets per direction.
const LARGE_MSG_SIZE: usize = 4000;

fn round_trip(client: &Transport, server: &Transport, payload: &[u8]) {
    let op = client.alloc_op();
    op.append_payload(payload);
    client
        .send_request(&op, server.local_address())
        .expect("send_request");

    while op.state() != OpState::Completed {
        client.poll();
        server.poll();
        if let Some(server_op) = server.receive_op() {
            let body = server_op.payload().expect("request payload");
            server_op.append_payload(&body);
            server.send_reply(&server_op).expect("send_reply");
            server.release_op(&server_op);
        }
    }
    client.release_op(&op);
}

fn bench_pingpong(c: &mut Criterion) {
    let network = LoopbackNetwork::new();
    let client = Transport::new(
        Arc::new(network.new_driver()),
        1,
        TransportConfig::default(),
    )
    .expect("client transport");
    let server = Transport::new(
        Arc::new(network.new_driver()),
        2,
        TransportConfig::default(),
    )
    .expect("server transport");

    let mut group = c.benchmark_group("pingpong");
    for size in [SMALL_MSG_SIZE, LARGE_MSG_SIZE] {
        group.throughput(Throughput::Bytes(2 * size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let payload = vec![0xA5u8; size];
            b.iter(|| round_trip(&client, &server, &payload));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pingpong);
criterion_main!(benches);
