// Media Manager benchmarks.
//
// Covers part reassembly (whole and chunked), the read-only next-parts
// selection and chunk-splitting paths, and content-digest verification.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use meshcast_core::error::TransportError;
use meshcast_core::media::{MediaManager, PartAddr, PlaybackSink, SegmentIndex};
use meshcast_core::transport::{Digest, Sha256Digest};

struct DiscardSink;

#[async_trait]
impl PlaybackSink for DiscardSink {
    async fn open(&self, _codec: &str) -> Result<(), TransportError> {
        Ok(())
    }
    async fn append(&self, _bytes: Bytes) -> Result<(), TransportError> {
        Ok(())
    }
    async fn end_of_stream(&self) {}
}

fn index_with_parts(n: usize) -> SegmentIndex {
    let clusters: Vec<serde_json::Value> =
        (0..n).map(|i| serde_json::json!({ "offset": (i as u64) * 1024 })).collect();
    serde_json::from_value(serde_json::json!({
        "total_size": (n as u64) * 1024,
        "duration": 60.0,
        "codec": "video/webm",
        "clusters": clusters,
    }))
    .unwrap()
}

fn new_manager(n_parts: usize) -> MediaManager {
    let (mut manager, _events) = MediaManager::new(Arc::new(DiscardSink), Arc::new(Sha256Digest));
    manager.set_metadata(index_with_parts(n_parts)).unwrap();
    manager
}

fn bench_append_whole_part(c: &mut Criterion) {
    // A tokio runtime is entered so the Media Manager's background append
    // pipeline (and the fire-and-forget completion task per part) has
    // somewhere to run; its worker threads drive them independently of the
    // benchmark loop itself.
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    c.bench_function("media/append_whole_part", |b| {
        b.iter_with_setup(
            || {
                let mut manager = new_manager(1);
                manager.mark_pending(0);
                manager
            },
            |mut manager| {
                manager.append_part(PartAddr::Whole(0), Bytes::from_static(b"a-single-cluster-buffer")).unwrap();
            },
        );
    });
}

fn bench_chunked_reassembly(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let mut group = c.benchmark_group("media/chunked_reassembly");

    for chunk_count in [4, 16, 64] {
        group.throughput(Throughput::Elements(chunk_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk_count), &chunk_count, |b, &of| {
            b.iter_with_setup(
                || {
                    let mut manager = new_manager(1);
                    manager.mark_pending(0);
                    manager
                },
                |mut manager| {
                    for chunk in 0..of {
                        manager
                            .append_part(PartAddr::Chunk { part: 0, chunk, of }, Bytes::from_static(b"chunk"))
                            .unwrap();
                    }
                },
            );
        });
    }

    group.finish();
}

fn bench_chunked_part_split(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let mut manager = new_manager(1);
    manager.mark_pending(0);
    let big_buffer = Bytes::from(vec![0xAB; 256 * 1024]);
    manager.append_part(PartAddr::Whole(0), big_buffer).unwrap();

    c.bench_function("media/chunked_part_split_256k", |b| {
        b.iter(|| manager.chunked_part(16 * 1024, 0).unwrap());
    });
}

fn bench_next_parts_to_download(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let mut group = c.benchmark_group("media/next_parts_to_download");

    for part_count in [10, 100, 1000] {
        let mut manager = new_manager(part_count);
        for p in 0..part_count as u32 {
            manager.record_remote_availability(format!("peer-{}", p % 7), [p]);
        }
        group.throughput(Throughput::Elements(part_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(part_count), &manager, |b, manager| {
            b.iter(|| manager.next_parts_to_download(5));
        });
    }

    group.finish();
}

fn bench_digest_compute(c: &mut Criterion) {
    let digest = Sha256Digest;
    let buffer = vec![0x42u8; 64 * 1024];

    c.bench_function("media/sha256_digest_64k", |b| {
        b.iter(|| digest.compute(&buffer));
    });
}

criterion_group!(
    benches,
    bench_append_whole_part,
    bench_chunked_reassembly,
    bench_chunked_part_split,
    bench_next_parts_to_download,
    bench_digest_compute,
);
criterion_main!(benches);
