//! End-to-end integration tests exercised entirely through the public API:
//! independently constructed `Router`s wired together by a shared in-memory
//! hub standing in for a signal service and real WebRTC transports, a real
//! gossip worker, and a real `MediaManager` with a recording sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use meshcast_core::config;
use meshcast_core::error::TransportError;
use meshcast_core::extensions::{Extensions, GossipControl};
use meshcast_core::gossip::{self, GossipCommand, GossipConfig, GossipEvent, NodeDescriptor};
use meshcast_core::media::{MediaEvent, MediaManager, PartAddr, PartStatus, PlaybackSink, SegmentIndex};
use meshcast_core::message::Message;
use meshcast_core::router::{Router, TransportFactory};
use meshcast_core::transport::{
    ConnectionState, IceCandidate, RendezvousChannel, SessionDescription, Sha256Digest, Transport,
};

// ---------------------------------------------------------------------------
// Hub harness: a shared peer-id -> Router registry standing in for a signal
// service. `to == ANY_PEER` fans out to every other registered node
// (mirroring how a real signal service relays `request-peer`); a concrete
// `to` is delivered straight to that node's `handle_message`.
// ---------------------------------------------------------------------------

type Hub = Arc<Mutex<HashMap<String, Arc<Router>>>>;

fn state_from_u8(v: u8) -> ConnectionState {
    match v {
        0 => ConnectionState::Connecting,
        1 => ConnectionState::Open,
        2 => ConnectionState::Closing,
        _ => ConnectionState::Closed,
    }
}

struct HubRendezvous {
    hub: Hub,
    self_id: String,
}

#[async_trait]
impl RendezvousChannel for HubRendezvous {
    fn state(&self) -> ConnectionState {
        ConnectionState::Open
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let targets: Vec<Arc<Router>> = {
            let table = self.hub.lock();
            if message.to == config::ANY_PEER {
                table.iter().filter(|entry| entry.0 != &self.self_id).map(|entry| entry.1.clone()).collect()
            } else {
                table.get(&message.to).cloned().into_iter().collect()
            }
        };
        for target in targets {
            target.handle_message(message.clone()).await;
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A direct channel toward one specific remote, looked up in the hub at
/// send time. Stays `Connecting` through `create_channel`/`create_sdp_offer`
/// (nothing usable yet, same as a real ICE handshake) and only reaches
/// `Open` once the answer side answers, or the offer side applies the
/// remote description — matching the state `Router::handle_answer` assumes.
struct HubTransport {
    hub: Hub,
    remote_id: String,
    state: AtomicU8,
}

impl HubTransport {
    fn new(hub: Hub, remote_id: String) -> Self {
        Self { hub, remote_id, state: AtomicU8::new(ConnectionState::Connecting as u8) }
    }
}

#[async_trait]
impl Transport for HubTransport {
    fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let target = self.hub.lock().get(&self.remote_id).cloned();
        if let Some(target) = target {
            target.handle_message(message).await;
        }
        Ok(())
    }

    async fn create_channel(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn create_sdp_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok("hub-offer".to_string())
    }

    async fn create_sdp_answer(
        &self,
        _remote_sdp: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.state.store(ConnectionState::Open as u8, Ordering::SeqCst);
        Ok("hub-answer".to_string())
    }

    async fn set_remote_description(&self, _sdp: SessionDescription) -> Result<(), TransportError> {
        self.state.store(ConnectionState::Open as u8, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
    }
}

struct HubTransportFactory {
    hub: Hub,
}

impl TransportFactory for HubTransportFactory {
    fn create(&self, remote_id: &str) -> Arc<dyn Transport> {
        Arc::new(HubTransport::new(self.hub.clone(), remote_id.to_string()))
    }
}

/// Builds a router registered in `hub` under `id`, having already adopted
/// that id from a synthesized `first-view`.
async fn hub_node(hub: &Hub, id: &str) -> Arc<Router> {
    let rendezvous = Arc::new(HubRendezvous { hub: hub.clone(), self_id: id.to_string() });
    let factory = Arc::new(HubTransportFactory { hub: hub.clone() });
    let router = Arc::new(Router::new(rendezvous, factory, Extensions::none()));

    let first_view =
        Message::new("first-view", config::SIGNAL, "").with_data(json!({ "id": id, "view": [] }));
    router.handle_message(first_view).await;

    hub.lock().insert(id.to_string(), router.clone());
    router
}

#[tokio::test]
async fn two_routers_complete_handshake_and_exchange_a_message() {
    let hub: Hub = Arc::new(Mutex::new(HashMap::new()));
    let router_a = hub_node(&hub, "node-a").await;
    let router_b = hub_node(&hub, "node-b").await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    router_b.subscribe(
        "app:ping",
        Box::new(move |msg: &Message| {
            let _ = tx.send(msg.clone());
        }),
    );

    router_a.request_peer(None, None).await.expect("request-peer should route without error");

    assert_eq!(router_a.connection_count(), 1);
    assert_eq!(router_b.connection_count(), 1);
    assert_eq!(router_a.open_connection_count(), 1, "A's side should have completed the handshake");
    assert_eq!(router_b.open_connection_count(), 1, "B's side should have completed the handshake");

    let ping = Message::new("app:ping", "node-a", "node-b").with_data(json!({ "hello": true }));
    router_a.send(ping, None, None).await.expect("direct send over the open connection");

    let received = rx.recv().await.expect("B should have received the ping directly");
    assert_eq!(received.from, "node-a");
    assert_eq!(received.data.get("hello").and_then(|v| v.as_bool()), Some(true));
}

#[tokio::test]
async fn request_peer_reaches_every_other_registered_node() {
    let hub: Hub = Arc::new(Mutex::new(HashMap::new()));
    let router_a = hub_node(&hub, "node-a").await;
    let router_b = hub_node(&hub, "node-b").await;
    let router_c = hub_node(&hub, "node-c").await;

    router_a.request_peer(None, None).await.unwrap();

    // A's request-peer fans out to both B and C via the hub rendezvous;
    // both answer, so A ends up directly connected to both.
    assert_eq!(router_a.open_connection_count(), 2);
    assert_eq!(router_b.open_connection_count(), 1);
    assert_eq!(router_c.open_connection_count(), 1);
}

// ---------------------------------------------------------------------------
// Gossip: real worker, driven through its public handle + event channel.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gossip_worker_applies_first_view_and_emits_a_snapshot() {
    let (handle, mut events) = gossip::spawn("node-a", GossipConfig::default());

    let seed = vec![NodeDescriptor::new("node-b"), NodeDescriptor::new("node-c")];
    handle.commands.send(GossipCommand::FirstView(seed)).expect("worker should still be running");

    let mut saw_view_update = false;
    for _ in 0..10 {
        match tokio::time::timeout(std::time::Duration::from_millis(200), events.recv()).await {
            Ok(Some(GossipEvent::ViewUpdate(view))) => {
                assert!(view.iter().any(|d| d.id == "node-b"));
                assert!(view.iter().any(|d| d.id == "node-c"));
                saw_view_update = true;
                break;
            }
            Ok(Some(GossipEvent::Outbound(_))) => continue,
            _ => break,
        }
    }
    assert!(saw_view_update, "worker should emit a ViewUpdate after adopting a first view");
    assert_eq!(handle.view_size(), 2);
}

#[tokio::test]
async fn router_caches_gossip_view_updates_via_its_event_loop() {
    let rendezvous = Arc::new(NullRendezvous);
    let hub: Hub = Arc::new(Mutex::new(HashMap::new()));
    let factory = Arc::new(HubTransportFactory { hub });
    let (handle, events) = gossip::spawn("node-a", GossipConfig::default());
    let handle = Arc::new(handle);

    let extensions = Extensions::none().with_gossip(handle.clone());
    let router = Arc::new(Router::new(rendezvous, factory, extensions));
    router.spawn_gossip_event_loop(events);

    let seed = vec![NodeDescriptor::new("node-b")];
    handle.commands.send(GossipCommand::FirstView(seed)).unwrap();

    let mut view = Vec::new();
    for _ in 0..20 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        view = router.last_view();
        if !view.is_empty() {
            break;
        }
    }
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, "node-b");
}

struct NullRendezvous;

#[async_trait]
impl RendezvousChannel for NullRendezvous {
    fn state(&self) -> ConnectionState {
        ConnectionState::Open
    }
    async fn send(&self, _message: Message) -> Result<(), TransportError> {
        Ok(())
    }
    async fn reconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Media: real MediaManager, a recording PlaybackSink, chunked reassembly.
// ---------------------------------------------------------------------------

struct RecordingSink {
    appended: Mutex<Vec<Bytes>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self { appended: Mutex::new(Vec::new()) })
    }
}

#[async_trait]
impl PlaybackSink for RecordingSink {
    async fn open(&self, _codec: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn append(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.appended.lock().push(bytes);
        Ok(())
    }

    async fn end_of_stream(&self) {}
}

fn sample_index() -> SegmentIndex {
    serde_json::from_value(json!({
        "total_size": 300,
        "duration": 12.0,
        "codec": "video/webm; codecs=\"vp9\"",
        "clusters": [
            { "offset": 0 },
            { "offset": 100 },
            { "offset": 200 }
        ]
    }))
    .unwrap()
}

/// Awaits `events` until `part`'s `PartAdded` has been seen, or panics
/// after a generous timeout. Other part's events are skipped over since
/// three parts are racing through the same append pipeline here.
async fn await_part_added(events: &mut mpsc::UnboundedReceiver<MediaEvent>, part: u32) {
    for _ in 0..16 {
        match tokio::time::timeout(std::time::Duration::from_secs(1), events.recv()).await {
            Ok(Some(MediaEvent::PartAdded { part: p, .. })) if p == part => return,
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    panic!("part {part} never reached Added over the events channel");
}

#[tokio::test]
async fn media_manager_reassembles_chunks_and_reaches_all_parts_added() {
    let sink = RecordingSink::new();
    let (mut media, mut events) = MediaManager::new(sink.clone(), Arc::new(Sha256Digest));
    media.set_metadata(sample_index()).unwrap();

    sink.open("video/webm").await.unwrap();
    let head_done = media.append_head(Bytes::from_static(b"init-segment"));

    for part in 0..3u32 {
        media.mark_pending(part);
    }

    media.append_part(PartAddr::Whole(0), Bytes::from_static(b"cluster-zero")).unwrap();
    await_part_added(&mut events, 0).await;
    assert_eq!(media.status_of(0), Some(PartStatus::Added));

    // Part 1 arrives in three out-of-order chunks.
    media.append_part(PartAddr::Chunk { part: 1, chunk: 2, of: 3 }, Bytes::from_static(b"-c")).unwrap();
    assert_eq!(media.status_of(1), Some(PartStatus::Pending));
    media.append_part(PartAddr::Chunk { part: 1, chunk: 0, of: 3 }, Bytes::from_static(b"a")).unwrap();
    media.append_part(PartAddr::Chunk { part: 1, chunk: 1, of: 3 }, Bytes::from_static(b"-b")).unwrap();
    await_part_added(&mut events, 1).await;
    assert_eq!(media.status_of(1), Some(PartStatus::Added));

    media.append_part(PartAddr::Whole(2), Bytes::from_static(b"cluster-two")).unwrap();
    await_part_added(&mut events, 2).await;

    assert!(media.all_parts_added());
    assert_eq!(media.added_count(), 3);
    assert_eq!(media.part_count(), 3);

    // Every part reached `Added`, so the manager should have signalled
    // end of stream on the sink right after part 2's completion.
    let stream_ended = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
        .await
        .expect("stream-ended event should arrive promptly")
        .expect("events channel should still be open");
    assert!(matches!(stream_ended, MediaEvent::StreamEnded));

    head_done.await.unwrap().unwrap();

    let chunked = media.chunked_part(1, 1).unwrap();
    assert_eq!(chunked.concat(), b"a-b-c".to_vec());

    let appended = sink.appended.lock().clone();
    assert!(appended.iter().any(|b| b.as_ref() == b"init-segment"));
    assert!(appended.iter().any(|b| b.as_ref() == b"cluster-zero"));
}
