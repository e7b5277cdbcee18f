//! # Media Manager
//!
//! Holds the segment index handed down by the (out-of-scope) container
//! demuxer, the per-part reassembly buffers, the ordered append pipeline
//! into the (out-of-scope) playback sink, and peer selection for the next
//! missing parts (spec.md §4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config;
use crate::error::{MediaError, TransportError};
use crate::extensions::HeavyPolicy;
use crate::gossip::HeavyPolicyHandle;
use crate::message::{Message, PeerId};
use crate::transport::Digest;
use crate::util;

// ---------------------------------------------------------------------------
// Segment index
// ---------------------------------------------------------------------------

/// One cluster boundary of the container format, as supplied by the
/// demuxer. Immutable for the lifetime of a [`SegmentIndex`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub offset: u64,
    pub timecode: f64,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// The demuxer-supplied description of the media file (spec.md §3).
/// Immutable once handed to [`MediaManager::set_metadata`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentIndex {
    pub total_size: u64,
    pub duration: f64,
    pub codec: String,
    pub clusters: Vec<Cluster>,
}

impl SegmentIndex {
    /// Inclusive HTTP byte range for part `i`.
    fn range_of_part(&self, i: usize) -> (u64, u64) {
        let start = self.clusters[i].offset;
        let end = if i + 1 < self.clusters.len() {
            self.clusters[i + 1].offset.saturating_sub(1)
        } else {
            self.total_size.saturating_sub(1)
        };
        (start, end)
    }

    /// Inclusive HTTP byte range for the head (bytes before the first
    /// cluster — container header, init segment, etc).
    fn range_of_head(&self) -> (u64, u64) {
        (0, self.clusters[0].offset.saturating_sub(1))
    }
}

// ---------------------------------------------------------------------------
// Parts
// ---------------------------------------------------------------------------

/// Monotonic lifecycle of one part (spec.md §3 invariant: no regressions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartStatus {
    Needed,
    Pending,
    Available,
    Added,
}

/// A part address as used by `append_part`: either the whole part in one
/// shot, or one chunk of a fragmented transfer.
#[derive(Debug, Clone, Copy)]
pub enum PartAddr {
    Whole(u32),
    Chunk { part: u32, chunk: u32, of: u32 },
}

impl PartAddr {
    fn part_number(self) -> u32 {
        match self {
            PartAddr::Whole(p) => p,
            PartAddr::Chunk { part, .. } => part,
        }
    }
}

/// One cluster's reassembly state.
struct Part {
    number: u32,
    status: PartStatus,
    buffer: Option<Bytes>,
    chunks: Option<Vec<Option<Bytes>>>,
    expected_chunk_count: Option<u32>,
    /// Set when this part is first marked `pending`; cleared never — used
    /// only to derive the pending-to-added latency reported on
    /// [`MediaEvent::PartAdded`].
    pending_since: Option<Instant>,
}

impl Part {
    fn new(number: u32) -> Self {
        Self {
            number,
            status: PartStatus::Needed,
            buffer: None,
            chunks: None,
            expected_chunk_count: None,
            pending_since: None,
        }
    }
}

/// Map from peer-id to the set of part numbers that peer has advertised.
#[derive(Default)]
pub struct RemoteAvailability {
    by_peer: HashMap<PeerId, std::collections::HashSet<u32>>,
}

impl RemoteAvailability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `peer` claims to have `parts`.
    pub fn advertise(&mut self, peer: PeerId, parts: impl IntoIterator<Item = u32>) {
        self.by_peer.entry(peer).or_default().extend(parts);
    }

    /// `remote_has_part(r, p)` from spec.md §4.7.
    pub fn remote_has_part(&self, peer: &str, part: u32) -> bool {
        self.by_peer.get(peer).is_some_and(|s| s.contains(&part))
    }

    /// Every peer that claims to have `part`.
    pub fn peers_with(&self, part: u32) -> Vec<PeerId> {
        self.by_peer
            .iter()
            .filter(|(_, parts)| parts.contains(&part))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Drops all knowledge of `peer` (on disconnect).
    pub fn forget(&mut self, peer: &str) {
        self.by_peer.remove(peer);
    }
}

// ---------------------------------------------------------------------------
// Playback sink capability
// ---------------------------------------------------------------------------

/// The out-of-scope playback sink the Media Manager feeds appended
/// buffers into, one at a time, in submission order.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Opens/initializes the sink for the given codec.
    async fn open(&self, codec: &str) -> Result<(), TransportError>;
    /// Appends one buffer. Must not be called again until this resolves.
    async fn append(&self, bytes: Bytes) -> Result<(), TransportError>;
    /// Signals that every part has been added; no further appends follow.
    async fn end_of_stream(&self);
}

/// A job in the ordered append pipeline.
struct AppendJob {
    bytes: Bytes,
    completion: oneshot::Sender<Result<(), TransportError>>,
}

/// Events emitted as parts move through the append pipeline, for the
/// embedder to observe without reaching into the part table itself.
#[derive(Debug)]
pub enum MediaEvent {
    /// A part's append completed and its status reached `Added`.
    PartAdded { part: u32, latency: Duration },
    /// A part's computed digest did not match the segment index (§7,
    /// non-fatal — the part is still added).
    DigestMismatch(MediaError),
    /// Every known part has reached `Added` and `end_of_stream` has been
    /// called on the sink.
    StreamEnded,
}

// ---------------------------------------------------------------------------
// Media Manager
// ---------------------------------------------------------------------------

/// Owns the segment index, part table, and the single-slot ordered append
/// pipeline into the playback sink.
pub struct MediaManager {
    segment_index: Option<SegmentIndex>,
    parts: Arc<Mutex<Vec<Part>>>,
    remote_availability: RemoteAvailability,
    digest: Arc<dyn Digest>,
    sink: Arc<dyn PlaybackSink>,
    append_tx: mpsc::UnboundedSender<AppendJob>,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
    head_appended: bool,
}

impl MediaManager {
    /// Creates a manager with no segment index yet, wiring the ordered
    /// append pipeline to `sink` on a background task that drains jobs
    /// strictly in submission order (spec.md §4.7, §5). Returns the
    /// manager alongside a receiver for [`MediaEvent`]s the embedder can
    /// use to drive metrics/notifications.
    pub fn new(
        sink: Arc<dyn PlaybackSink>,
        digest: Arc<dyn Digest>,
    ) -> (Self, mpsc::UnboundedReceiver<MediaEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<AppendJob>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<MediaEvent>();

        let pipeline_sink = sink.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = pipeline_sink.append(job.bytes).await;
                let _ = job.completion.send(result);
            }
        });

        let manager = Self {
            segment_index: None,
            parts: Arc::new(Mutex::new(Vec::new())),
            remote_availability: RemoteAvailability::new(),
            digest,
            sink,
            append_tx: tx,
            events_tx,
            head_appended: false,
        };
        (manager, events_rx)
    }

    /// `set_metadata`: populates `parts[i] = {needed}` for each cluster.
    /// The segment index is immutable once set (spec.md §3).
    pub fn set_metadata(&mut self, index: SegmentIndex) -> Result<(), MediaError> {
        if self.segment_index.is_some() {
            return Err(MediaError::MetadataAlreadySet);
        }
        *self.parts.lock() = (0..index.clusters.len() as u32).map(Part::new).collect();
        self.segment_index = Some(index);
        Ok(())
    }

    fn index(&self) -> &SegmentIndex {
        self.segment_index.as_ref().expect("segment index not set")
    }

    /// Inclusive HTTP byte-range string for part `i`.
    pub fn range_of_part(&self, i: usize) -> String {
        let (lo, hi) = self.index().range_of_part(i);
        format!("bytes={}-{}", lo, hi)
    }

    /// Inclusive HTTP byte-range string for the head.
    pub fn range_of_head(&self) -> String {
        let (lo, hi) = self.index().range_of_head();
        format!("bytes={}-{}", lo, hi)
    }

    /// Schedules `bytes` as the first buffer in the ordered append chain.
    /// Returns a handle the caller can await for completion.
    pub fn append_head(&mut self, bytes: Bytes) -> oneshot::Receiver<Result<(), TransportError>> {
        self.head_appended = true;
        self.enqueue_append(bytes)
    }

    fn enqueue_append(&self, bytes: Bytes) -> oneshot::Receiver<Result<(), TransportError>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.append_tx.send(AppendJob { bytes, completion: tx });
        rx
    }

    /// `append(number, bytes)` — whole part or one chunk of a fragmented
    /// transfer. Requires the part to currently be `Pending`.
    pub fn append_part(&mut self, addr: PartAddr, bytes: Bytes) -> Result<(), MediaError> {
        let number = addr.part_number();

        let became_available = {
            let mut parts = self.parts.lock();
            let part = parts
                .iter_mut()
                .find(|p| p.number == number)
                .ok_or(MediaError::PartOutOfRange(number))?;

            if part.status != PartStatus::Pending {
                return Err(MediaError::UnexpectedPart {
                    part: number,
                    status: format!("{:?}", part.status),
                });
            }

            match addr {
                PartAddr::Whole(_) => {
                    part.buffer = Some(bytes);
                    part.status = PartStatus::Available;
                }
                PartAddr::Chunk { chunk, of, .. } => {
                    let chunks = part.chunks.get_or_insert_with(|| vec![None; of as usize]);
                    if chunks.len() < of as usize {
                        chunks.resize(of as usize, None);
                    }
                    chunks[chunk as usize] = Some(bytes);
                    part.expected_chunk_count = Some(of);

                    if chunks.iter().all(Option::is_some) {
                        let mut combined = Vec::new();
                        for c in chunks.iter() {
                            combined.extend_from_slice(c.as_ref().unwrap());
                        }
                        part.buffer = Some(Bytes::from(combined));
                        part.status = PartStatus::Available;
                    }
                }
            }

            part.status == PartStatus::Available
        };

        if became_available {
            self.submit_available_part(number);
        }
        Ok(())
    }

    /// Marks a part `pending` once a download has been claimed for it
    /// (the router-facing counterpart of `next_parts_to_download`).
    pub fn mark_pending(&mut self, number: u32) {
        let mut parts = self.parts.lock();
        if let Some(p) = parts.iter_mut().find(|p| p.number == number) {
            if p.status == PartStatus::Needed {
                p.status = PartStatus::Pending;
                p.pending_since = Some(Instant::now());
            }
        }
    }

    /// Enqueues the part's buffer for append and schedules the status
    /// transition to `Added` strictly after that append's completion
    /// handle resolves successfully (spec.md §4.7). Once every part has
    /// reached `Added` this way, signals `end_of_stream` on the sink.
    fn submit_available_part(&mut self, number: u32) {
        let (buffer, expected_digest, pending_since) = {
            let parts = self.parts.lock();
            let part = parts.iter().find(|p| p.number == number).unwrap();
            let buffer = part.buffer.clone().unwrap_or_default();
            let expected = self
                .segment_index
                .as_ref()
                .and_then(|i| i.clusters.get(number as usize))
                .and_then(|c| c.sha256.clone());
            (buffer, expected, part.pending_since)
        };

        if let Some(expected) = expected_digest {
            let actual = self.digest.compute(&buffer);
            if actual != expected {
                let err = MediaError::DigestMismatch { part: number, expected, actual };
                warn!(part = number, error = %err, "content digest mismatch");
                let _ = self.events_tx.send(MediaEvent::DigestMismatch(err));
            }
        }

        let rx = self.enqueue_append(buffer);
        let parts = self.parts.clone();
        let sink = self.sink.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let Ok(Ok(())) = rx.await else { return };

            let stream_ended = {
                let mut parts = parts.lock();
                if let Some(p) = parts.iter_mut().find(|p| p.number == number) {
                    p.status = PartStatus::Added;
                }
                !parts.is_empty() && parts.iter().all(|p| p.status == PartStatus::Added)
            };

            let latency = pending_since.map(|since| since.elapsed()).unwrap_or_default();
            let _ = events_tx.send(MediaEvent::PartAdded { part: number, latency });

            if stream_ended {
                sink.end_of_stream().await;
                let _ = events_tx.send(MediaEvent::StreamEnded);
            }
        });
    }

    /// True once every known part has reached `Added`.
    pub fn all_parts_added(&self) -> bool {
        let parts = self.parts.lock();
        !parts.is_empty() && parts.iter().all(|p| p.status == PartStatus::Added)
    }

    /// `peer_has_part(p)`.
    pub fn peer_has_part(&self, p: u32) -> bool {
        self.parts
            .lock()
            .iter()
            .find(|x| x.number == p)
            .is_some_and(|x| matches!(x.status, PartStatus::Available | PartStatus::Added))
    }

    /// `remote_has_part(r, p)`.
    pub fn remote_has_part(&self, remote: &str, p: u32) -> bool {
        self.remote_availability.remote_has_part(remote, p)
    }

    /// Records that `peer` advertises having `parts`.
    pub fn record_remote_availability(&mut self, peer: PeerId, parts: impl IntoIterator<Item = u32>) {
        self.remote_availability.advertise(peer, parts);
    }

    /// `next_parts_to_download(k)`: the first `k` `needed` parts in index
    /// order, each paired with a random peer known to have it, or the
    /// `"source"` sentinel if none does.
    pub fn next_parts_to_download(&self, k: usize) -> Vec<(u32, PeerId)> {
        self.parts
            .lock()
            .iter()
            .filter(|p| p.status == PartStatus::Needed)
            .take(k)
            .map(|p| {
                let candidates = util::shuffled(&self.remote_availability.peers_with(p.number));
                let peer = candidates.into_iter().next().unwrap_or_else(|| config::SOURCE.to_string());
                (p.number, peer)
            })
            .collect()
    }

    /// `chunked_part(chunk_size, p)`: splits an available/added part's
    /// buffer into contiguous chunks of at most `chunk_size` bytes.
    pub fn chunked_part(&self, chunk_size: usize, p: u32) -> Result<Vec<Bytes>, MediaError> {
        let parts = self.parts.lock();
        let part = parts.iter().find(|x| x.number == p).ok_or(MediaError::PartOutOfRange(p))?;
        if !matches!(part.status, PartStatus::Available | PartStatus::Added) {
            return Err(MediaError::UnexpectedPart {
                part: p,
                status: format!("{:?}", part.status),
            });
        }
        let buffer = part.buffer.clone().unwrap_or_default();
        Ok(buffer.chunks(chunk_size.max(1)).map(Bytes::copy_from_slice).collect())
    }

    /// Status of part `p`, for diagnostics/tests.
    pub fn status_of(&self, p: u32) -> Option<PartStatus> {
        self.parts.lock().iter().find(|x| x.number == p).map(|x| x.status)
    }

    /// Total number of known parts, once metadata has been set.
    pub fn part_count(&self) -> usize {
        self.parts.lock().len()
    }

    /// Number of parts that have reached `Added`.
    pub fn added_count(&self) -> usize {
        self.parts.lock().iter().filter(|p| p.status == PartStatus::Added).count()
    }
}

/// Declares media `part`/`chunk` delivery messages heavy, backed by a
/// [`crate::gossip::GossipHandle`] for the admission cap (§4.8:
/// extensions compose without the router knowing either one's internals).
pub struct MediaHeavyPolicy {
    cap: Arc<dyn HeavyPolicyHandle>,
}

impl MediaHeavyPolicy {
    pub fn new(cap: Arc<dyn HeavyPolicyHandle>) -> Self {
        Self { cap }
    }
}

impl HeavyPolicy for MediaHeavyPolicy {
    fn is_heavy(&self, message: &Message) -> bool {
        matches!(message.type_.as_str(), "media:part-response" | "media:chunk")
    }

    fn max_connections(&self) -> usize {
        self.cap.max_connections()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;
    #[async_trait]
    impl PlaybackSink for NullSink {
        async fn open(&self, _codec: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn append(&self, _bytes: Bytes) -> Result<(), TransportError> {
            Ok(())
        }
        async fn end_of_stream(&self) {}
    }

    struct FixedDigest(&'static str);
    impl Digest for FixedDigest {
        fn compute(&self, _bytes: &[u8]) -> String {
            self.0.to_string()
        }
    }

    fn index(n: usize) -> SegmentIndex {
        SegmentIndex {
            total_size: 1000,
            duration: 10.0,
            codec: "vp9".into(),
            clusters: (0..n)
                .map(|i| Cluster {
                    offset: (i as u64) * 100,
                    timecode: i as f64,
                    sha256: None,
                })
                .collect(),
        }
    }

    fn manager() -> (MediaManager, mpsc::UnboundedReceiver<MediaEvent>) {
        MediaManager::new(Arc::new(NullSink), Arc::new(FixedDigest("deadbeef")))
    }

    #[tokio::test]
    async fn range_of_part_and_head() {
        let (mut m, _events) = manager();
        m.set_metadata(index(3)).unwrap();
        assert_eq!(m.range_of_head(), "bytes=0-0");
        assert_eq!(m.range_of_part(0), "bytes=0-99");
        assert_eq!(m.range_of_part(2), "bytes=200-999");
    }

    #[tokio::test]
    async fn set_metadata_twice_fails() {
        let (mut m, _events) = manager();
        m.set_metadata(index(1)).unwrap();
        assert!(matches!(m.set_metadata(index(1)), Err(MediaError::MetadataAlreadySet)));
    }

    #[tokio::test]
    async fn append_requires_pending_status() {
        let (mut m, _events) = manager();
        m.set_metadata(index(1)).unwrap();
        // Part 0 is `Needed`, not `Pending` yet.
        let err = m.append_part(PartAddr::Whole(0), Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, MediaError::UnexpectedPart { .. }));
    }

    #[tokio::test]
    async fn chunked_reassembly_concatenates_in_order() {
        let (mut m, mut events) = manager();
        m.set_metadata(index(6)).unwrap();
        m.mark_pending(5);

        m.append_part(
            PartAddr::Chunk { part: 5, chunk: 0, of: 3 },
            Bytes::from_static(b"AAA"),
        )
        .unwrap();
        assert_eq!(m.status_of(5), Some(PartStatus::Pending));

        m.append_part(
            PartAddr::Chunk { part: 5, chunk: 2, of: 3 },
            Bytes::from_static(b"CCC"),
        )
        .unwrap();
        m.append_part(
            PartAddr::Chunk { part: 5, chunk: 1, of: 3 },
            Bytes::from_static(b"BBB"),
        )
        .unwrap();

        // All three chunks present now; the transition to `Added` happens
        // on the append pipeline's task once its completion handle
        // resolves, so wait for the event rather than asserting inline.
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("part-added event should arrive promptly")
            .expect("events channel should still be open");
        assert!(matches!(event, MediaEvent::PartAdded { part: 5, .. }));

        assert_eq!(m.status_of(5), Some(PartStatus::Added));
        assert!(m.peer_has_part(5));
    }

    #[tokio::test]
    async fn next_parts_to_download_prefers_advertising_peer_then_source() {
        let (mut m, _events) = manager();
        m.set_metadata(index(3)).unwrap();
        m.record_remote_availability("peer-a".into(), vec![1]);

        let picks = m.next_parts_to_download(3);
        assert_eq!(picks.len(), 3);
        assert_eq!(picks[0], (0, config::SOURCE.to_string()));
        assert_eq!(picks[1].0, 1);
        assert_eq!(picks[1].1, "peer-a");
        assert_eq!(picks[2], (2, config::SOURCE.to_string()));
    }

    #[tokio::test]
    async fn chunked_part_rejects_non_available_status() {
        let (mut m, _events) = manager();
        m.set_metadata(index(2)).unwrap();
        assert!(m.chunked_part(16, 0).is_err());
    }

    #[tokio::test]
    async fn digest_mismatch_emits_event_but_still_adds_the_part() {
        let mut index = index(1);
        index.clusters[0].sha256 = Some("expected-digest".to_string());
        let (mut m, mut events) = manager();
        m.set_metadata(index).unwrap();
        m.mark_pending(0);

        m.append_part(PartAddr::Whole(0), Bytes::from_static(b"payload")).unwrap();

        let mut saw_mismatch = false;
        for _ in 0..2 {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Some(MediaEvent::DigestMismatch(MediaError::DigestMismatch { part: 0, .. }))) => {
                    saw_mismatch = true;
                }
                Ok(Some(MediaEvent::PartAdded { part: 0, .. })) => break,
                _ => break,
            }
        }
        assert!(saw_mismatch, "digest mismatch should be reported over the events channel");
        assert_eq!(m.status_of(0), Some(PartStatus::Added));
    }
}
