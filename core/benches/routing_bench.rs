// Routing-path benchmarks.
//
// Covers the Connection Table lookups `process_message` leans on for every
// send (direct-neighbor check, open-peer iteration for broadcast), message
// ttl/forward-by bookkeeping, and the weight-protocol admission decision.

use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use meshcast_core::connection::{Connection, ConnectionTable};
use meshcast_core::error::TransportError;
use meshcast_core::gossip::{decide_weight, WeightAction};
use meshcast_core::message::Message;
use meshcast_core::transport::{ConnectionState, IceCandidate, SessionDescription, Transport};

/// Always-open, non-blocking transport — enough to populate a
/// `ConnectionTable` without spinning up async machinery.
struct AlwaysOpenTransport;

#[async_trait::async_trait]
impl Transport for AlwaysOpenTransport {
    fn state(&self) -> ConnectionState {
        ConnectionState::Open
    }
    async fn send(&self, _message: Message) -> Result<(), TransportError> {
        Ok(())
    }
    async fn create_channel(&self) -> Result<(), TransportError> {
        Ok(())
    }
    async fn create_sdp_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(String::new())
    }
    async fn create_sdp_answer(&self, _remote_sdp: SessionDescription) -> Result<SessionDescription, TransportError> {
        Ok(String::new())
    }
    async fn set_remote_description(&self, _sdp: SessionDescription) -> Result<(), TransportError> {
        Ok(())
    }
    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        Ok(())
    }
    async fn close(&self) {}
}

fn table_with_n_open_peers(n: usize) -> ConnectionTable {
    let mut table = ConnectionTable::new();
    for i in 0..n {
        table.insert(Connection::new(format!("peer-{i}"), Arc::new(AlwaysOpenTransport)));
    }
    table
}

fn bench_is_open_neighbor_hit(c: &mut Criterion) {
    let table = table_with_n_open_peers(200);
    c.bench_function("routing/is_open_neighbor_hit", |b| {
        b.iter(|| table.is_open_neighbor("peer-150"));
    });
}

fn bench_is_open_neighbor_miss(c: &mut Criterion) {
    let table = table_with_n_open_peers(200);
    c.bench_function("routing/is_open_neighbor_miss", |b| {
        b.iter(|| table.is_open_neighbor("peer-not-there"));
    });
}

fn bench_open_peers_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing/open_peers_fanout");

    for peer_count in [10, 50, 200, 1000] {
        let table = table_with_n_open_peers(peer_count);
        group.throughput(Throughput::Elements(peer_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(peer_count), &table, |b, table| {
            b.iter(|| table.open_peers().filter(|c| c.remote_id != "peer-0").count());
        });
    }

    group.finish();
}

fn bench_message_forwarded_by(c: &mut Criterion) {
    let base = Message::new("icecandidate", "node-a", "node-z").with_ttl(8);
    c.bench_function("routing/message_forwarded_by", |b| {
        b.iter(|| base.clone().forwarded_by("node-mid"));
    });
}

fn bench_message_validate(c: &mut Criterion) {
    let message = Message::new("offer", "node-a", "node-b").with_ttl(3);
    c.bench_function("routing/message_validate", |b| {
        b.iter(|| message.validate());
    });
}

fn bench_decide_weight(c: &mut Criterion) {
    c.bench_function("routing/decide_weight_admit", |b| {
        b.iter(|| decide_weight(WeightAction::RequestHeavy, false, 2, 8));
    });
}

fn bench_idle_peers_scan(c: &mut Criterion) {
    let table = table_with_n_open_peers(500);
    let threshold = std::time::Duration::from_millis(10_000);
    c.bench_function("routing/idle_peers_scan_500", |b| {
        b.iter(|| table.idle_peers(threshold, Instant::now()));
    });
}

criterion_group!(
    benches,
    bench_is_open_neighbor_hit,
    bench_is_open_neighbor_miss,
    bench_open_peers_fanout,
    bench_message_forwarded_by,
    bench_message_validate,
    bench_decide_weight,
    bench_idle_peers_scan,
);
criterion_main!(benches);
