//! # Gossip Engine
//!
//! Maintains a bounded random view of the network, periodically exchanges
//! view slices with a random neighbor, tracks this node's own bandwidth
//! samples, and computes the heavy-connection admission cap (spec.md
//! §4.6).
//!
//! The engine's logic ([`GossipEngine`]) is kept synchronous and
//! allocation-light so it's trivially unit-testable; [`GossipWorker`] is
//! the thin async wrapper that runs it on its own cooperative task and
//! talks to the Peer Core only by message-passing over channels, per the
//! concurrency model in spec.md §5 ("the Peer Core never holds the view
//! mutably").

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config;
use crate::extensions::GossipControl;
use crate::message::{Message, PeerId};
use crate::util;

// ---------------------------------------------------------------------------
// Node descriptor / view
// ---------------------------------------------------------------------------

/// A gossip-exchanged description of one node. `id` and `age` are fixed
/// fields; everything else (notably `media.bandwidth` / `media.parts`)
/// lives in `extra` so extensions can add fields via `descriptor-update`
/// without a schema migration (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: PeerId,
    pub age: u64,
    #[serde(default)]
    pub extra: serde_json::Map<String, Value>,
}

impl NodeDescriptor {
    /// A freshly seen descriptor with no extra fields.
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            age: 0,
            extra: serde_json::Map::new(),
        }
    }

    /// Reads `media.bandwidth` if present.
    pub fn bandwidth(&self) -> Option<f64> {
        self.extra.get("media")?.get("bandwidth")?.as_f64()
    }

    /// Reads `media.parts` if present.
    pub fn parts(&self) -> Option<Vec<u32>> {
        let arr = self.extra.get("media")?.get("parts")?.as_array()?;
        Some(arr.iter().filter_map(Value::as_u64).map(|n| n as u32).collect())
    }

    /// Applies a path-addressed patch (`descriptor-update`, spec.md §4.6).
    /// `path[0] == "age"` updates the fixed field directly; everything
    /// else walks/creates nested objects under `extra`.
    pub fn apply_patch(&mut self, path: &[String], value: Value) {
        if path.is_empty() {
            return;
        }
        if path.len() == 1 && path[0] == "age" {
            if let Some(n) = value.as_u64() {
                self.age = n;
            }
            return;
        }
        let mut cursor = &mut self.extra;
        for key in &path[..path.len() - 1] {
            cursor = cursor
                .entry(key.clone())
                .or_insert_with(|| json!({}))
                .as_object_mut()
                .expect("descriptor-update path segment collided with a non-object field");
        }
        cursor.insert(path[path.len() - 1].clone(), value);
    }

    fn set_bandwidth(&mut self, bw: f64) {
        self.apply_patch(
            &["media".to_string(), "bandwidth".to_string()],
            json!(bw),
        );
    }
}

/// A bounded, ordered sample of known remote peers.
#[derive(Debug, Default)]
pub struct View {
    entries: Vec<NodeDescriptor>,
    capacity: usize,
}

impl View {
    /// Creates an empty view bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    /// Current entries, in view order.
    pub fn entries(&self) -> &[NodeDescriptor] {
        &self.entries
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the view holds no descriptors.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replaces the entire view (e.g. from `first-view` or a worker
    /// `view-update`), truncating to capacity.
    pub fn replace(&mut self, mut entries: Vec<NodeDescriptor>) {
        entries.truncate(self.capacity);
        self.entries = entries;
    }

    /// Merges `incoming` descriptors into the view: newer ages replace
    /// older ones for a known id, new ids are appended, and the view is
    /// truncated back to capacity (oldest-appended entries drop first).
    pub fn merge(&mut self, incoming: Vec<NodeDescriptor>) {
        for desc in incoming {
            if let Some(existing) = self.entries.iter_mut().find(|e| e.id == desc.id) {
                if desc.age >= existing.age {
                    *existing = desc;
                }
            } else {
                self.entries.push(desc);
            }
        }
        if self.entries.len() > self.capacity {
            self.entries.truncate(self.capacity);
        }
    }

    /// Upserts a single descriptor (used to reflect `descriptor-update`
    /// back into the view for our own id).
    pub fn upsert(&mut self, desc: NodeDescriptor) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.id == desc.id) {
            *existing = desc;
        } else if self.entries.len() < self.capacity {
            self.entries.push(desc);
        }
    }

    /// A random sample slice of up to `n` entries, for exchange payloads.
    pub fn sample(&self, n: usize) -> Vec<NodeDescriptor> {
        let shuffled = util::shuffled(&self.entries);
        shuffled.into_iter().take(n).collect()
    }

    /// A random neighbor id, excluding `exclude`.
    pub fn random_peer(&self, exclude: &str) -> Option<PeerId> {
        let candidates: Vec<&NodeDescriptor> =
            self.entries.iter().filter(|e| e.id != exclude).collect();
        util::random_choice(&candidates).map(|d| d.id.clone())
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Tuning knobs for the gossip engine.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Maximum number of descriptors the view holds.
    pub view_size: usize,
    /// How often the worker initiates a view exchange with a random peer.
    pub exchange_interval: Duration,
    /// How many descriptors to include in one exchange payload.
    pub exchange_sample_size: usize,
    /// How many bandwidth samples to average over.
    pub bandwidth_window: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            view_size: 30,
            exchange_interval: Duration::from_secs(5),
            exchange_sample_size: 8,
            bandwidth_window: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Weight protocol
// ---------------------------------------------------------------------------

/// The six values `gossip:weight` can carry (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WeightAction {
    RequestHeavy,
    AckHeavy,
    NoackHeavy,
    RequestLight,
    AckLight,
    NoackLight,
}

/// What the router should do to its connection-table entry after a
/// weight-protocol message. Produced by the pure decision functions below
/// so they stay unit-testable without a `ConnectionTable` in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightDecision {
    /// Set incoming weight to Heavy and reply `ack-heavy`.
    AdmitHeavy,
    /// Leave incoming weight as-is and reply `noack-heavy`.
    DenyHeavy,
    /// Set incoming weight to Light and reply `ack-light`.
    DowngradeToLight,
    /// Set our outgoing weight to Heavy (we received `ack-heavy`).
    ConfirmOutgoingHeavy,
    /// Set our outgoing weight to Light (we received `ack-light`).
    ConfirmOutgoingLight,
    /// `noack-*` — no state change.
    NoOp,
}

/// Decides the outcome of an incoming `gossip:weight` message, given the
/// current incoming weight on that connection and the heavy-admission cap.
pub fn decide_weight(
    action: WeightAction,
    incoming_is_heavy: bool,
    heavy_count: usize,
    max_connections: usize,
) -> WeightDecision {
    match action {
        WeightAction::RequestHeavy => {
            if !incoming_is_heavy && heavy_count < max_connections {
                WeightDecision::AdmitHeavy
            } else {
                WeightDecision::DenyHeavy
            }
        }
        WeightAction::RequestLight => WeightDecision::DowngradeToLight,
        WeightAction::AckHeavy => WeightDecision::ConfirmOutgoingHeavy,
        WeightAction::AckLight => WeightDecision::ConfirmOutgoingLight,
        WeightAction::NoackHeavy | WeightAction::NoackLight => WeightDecision::NoOp,
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Synchronous gossip logic: view maintenance, bandwidth tracking, and the
/// `max_connections` computation. Holds no transport or connection-table
/// state — it only ever produces [`Message`]s for the caller to send.
pub struct GossipEngine {
    self_id: PeerId,
    config: GossipConfig,
    view: View,
    self_descriptor: NodeDescriptor,
    bandwidth_samples: VecDeque<f64>,
}

impl GossipEngine {
    /// Creates an engine for `self_id` with the given configuration. The
    /// view starts empty until `handle_first_view` is called.
    pub fn new(self_id: impl Into<PeerId>, config: GossipConfig) -> Self {
        let self_id = self_id.into();
        Self {
            self_descriptor: NodeDescriptor::new(self_id.clone()),
            view: View::new(config.view_size),
            bandwidth_samples: VecDeque::with_capacity(config.bandwidth_window),
            self_id,
            config,
        }
    }

    /// `first-view`: adopts the rendezvous-provided initial view.
    pub fn handle_first_view(&mut self, entries: Vec<NodeDescriptor>) {
        self.view.replace(entries);
    }

    /// Current view snapshot.
    pub fn view(&self) -> &View {
        &self.view
    }

    /// `gossip:bandwidth`: records a sample and republishes the rolling
    /// mean into our own descriptor.
    pub fn record_bandwidth(&mut self, sample: f64) {
        if self.bandwidth_samples.len() == self.config.bandwidth_window {
            self.bandwidth_samples.pop_front();
        }
        self.bandwidth_samples.push_back(sample);
        let samples: Vec<f64> = self.bandwidth_samples.iter().copied().collect();
        if let Some(m) = util::mean(&samples) {
            self.self_descriptor.set_bandwidth(m);
            self.view.upsert(self.self_descriptor.clone());
        }
    }

    /// `gossip:descriptor-update`: applies a path-addressed patch to our
    /// own descriptor and reflects it into the view.
    pub fn handle_descriptor_update(&mut self, path: Vec<String>, value: Value) {
        self.self_descriptor.apply_patch(&path, value);
        self.view.upsert(self.self_descriptor.clone());
    }

    /// spec.md §4.6 admission cap. `ceil(ln(|view|+1))`, scaled by
    /// `self_bw / view_mean_bw` when at least one neighbor advertises
    /// bandwidth.
    pub fn max_connections(&self) -> usize {
        let base = ((self.view.len() as f64 + 1.0).ln()).ceil().max(0.0);
        let neighbor_bws: Vec<f64> = self.view.entries().iter().filter_map(|d| d.bandwidth()).collect();
        let scaled = match util::mean(&neighbor_bws) {
            Some(view_mean) if view_mean > 0.0 => {
                let self_bw = self.self_descriptor.bandwidth().unwrap_or(view_mean);
                base * (self_bw / view_mean)
            }
            _ => base,
        };
        scaled.ceil().max(0.0) as usize
    }

    /// Builds a `gossip:request-exchange` toward a random neighbor
    /// (excluding ourselves), carrying a random sample of our view. `None`
    /// if the view has no other entries yet.
    pub fn initiate_exchange(&self) -> Option<Message> {
        let target = self.view.random_peer(&self.self_id)?;
        let sample = self.view.sample(self.config.exchange_sample_size);
        Some(
            Message::new("gossip:request-exchange", self.self_id.clone(), target)
                .with_ttl(0)
                .with_data(json!({ "view": sample })),
        )
    }

    /// `gossip:request-exchange`: merges the sender's sample into our
    /// view and builds the `gossip:answer-request` reply carrying ours.
    pub fn handle_request_exchange(&mut self, from: &str, incoming: Vec<NodeDescriptor>) -> Message {
        self.view.merge(incoming);
        let sample = self.view.sample(self.config.exchange_sample_size);
        Message::new("gossip:answer-request", self.self_id.clone(), from)
            .with_ttl(0)
            .with_data(json!({ "view": sample }))
    }

    /// `gossip:answer-request`: merges the peer's returned sample.
    pub fn handle_answer_request(&mut self, incoming: Vec<NodeDescriptor>) {
        self.view.merge(incoming);
    }
}

impl GossipControl for GossipEngine {
    fn view_size(&self) -> usize {
        self.view.len()
    }
}

// ---------------------------------------------------------------------------
// Worker: runs the engine on its own cooperative task
// ---------------------------------------------------------------------------

/// Commands the Peer Core forwards to the gossip worker (spec.md §5: only
/// these four tags cross into the gossip context).
#[derive(Debug)]
pub enum GossipCommand {
    FirstView(Vec<NodeDescriptor>),
    RequestExchange { from: PeerId, view: Vec<NodeDescriptor> },
    AnswerRequest { view: Vec<NodeDescriptor> },
    DescriptorUpdate { path: Vec<String>, value: Value },
    RecordBandwidth(f64),
}

/// Messages the worker emits back to the Peer Core: either an outbound
/// wire [`Message`] to route, or a view snapshot to cache.
#[derive(Debug)]
pub enum GossipEvent {
    Outbound(Message),
    ViewUpdate(Vec<NodeDescriptor>),
}

/// Router-side handle: shares a read-only snapshot of the engine's
/// `max_connections`/view size without round-tripping through the
/// channel, and lets the router send commands / receive events.
pub struct GossipHandle {
    max_connections: Arc<RwLock<usize>>,
    view_size: Arc<RwLock<usize>>,
    pub commands: mpsc::UnboundedSender<GossipCommand>,
}

impl GossipControl for GossipHandle {
    fn view_size(&self) -> usize {
        *self.view_size.read()
    }

    fn handle_gossip_message(&self, message: Message) {
        let command = match message.type_.as_str() {
            "first-view" => message
                .data
                .get("view")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .map(GossipCommand::FirstView),
            "gossip:request-exchange" => message
                .data
                .get("view")
                .cloned()
                .and_then(|v| serde_json::from_value::<Vec<NodeDescriptor>>(v).ok())
                .map(|view| GossipCommand::RequestExchange {
                    from: message.from.clone(),
                    view,
                }),
            "gossip:answer-request" => message
                .data
                .get("view")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .map(GossipCommand::AnswerRequest),
            "gossip:descriptor-update" => {
                let path = message
                    .data
                    .get("path")
                    .and_then(|p| p.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                let value = message.data.get("value").cloned().unwrap_or(Value::Null);
                Some(GossipCommand::DescriptorUpdate { path, value })
            }
            "gossip:bandwidth" => message
                .data
                .get("sample")
                .and_then(Value::as_f64)
                .map(GossipCommand::RecordBandwidth),
            _ => {
                trace!(msg_type = %message.type_, "not a gossip-handled message type");
                None
            }
        };
        if let Some(command) = command {
            let _ = self.commands.send(command);
        }
    }
}

impl HeavyPolicyHandle for GossipHandle {
    fn max_connections(&self) -> usize {
        *self.max_connections.read()
    }
}

/// Narrow trait so `GossipHandle` can back [`crate::extensions::HeavyPolicy`]
/// without depending on media-layer "what counts as heavy" logic, which
/// lives with the caller (media transfers are heavy; everything else isn't).
pub trait HeavyPolicyHandle: Send + Sync {
    fn max_connections(&self) -> usize;
}

/// Runs a [`GossipEngine`] as a standalone cooperative task. Spawn with
/// [`spawn`]; the returned [`GossipHandle`] is the only thing the Peer
/// Core needs to hold.
pub struct GossipWorker {
    engine: GossipEngine,
    commands: mpsc::UnboundedReceiver<GossipCommand>,
    events: mpsc::UnboundedSender<GossipEvent>,
    max_connections: Arc<RwLock<usize>>,
    view_size: Arc<RwLock<usize>>,
    exchange_interval: Duration,
}

/// Spawns a gossip worker task, returning the router-side handle and the
/// event receiver it should poll for outbound messages / view updates.
pub fn spawn(
    self_id: impl Into<PeerId>,
    config: GossipConfig,
) -> (GossipHandle, mpsc::UnboundedReceiver<GossipEvent>) {
    let engine = GossipEngine::new(self_id, config.clone());
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel();
    let max_connections = Arc::new(RwLock::new(engine.max_connections()));
    let view_size = Arc::new(RwLock::new(engine.view().len()));

    let worker = GossipWorker {
        engine,
        commands: cmd_rx,
        events: evt_tx,
        max_connections: max_connections.clone(),
        view_size: view_size.clone(),
        exchange_interval: config.exchange_interval,
    };
    tokio::spawn(worker.run());

    (
        GossipHandle {
            max_connections,
            view_size,
            commands: cmd_tx,
        },
        evt_rx,
    )
}

impl GossipWorker {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.exchange_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(msg) = self.engine.initiate_exchange() {
                        let _ = self.events.send(GossipEvent::Outbound(msg));
                    }
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            debug!("gossip command channel closed, worker shutting down");
                            break;
                        }
                    }
                }
            }
            self.publish_snapshot();
        }
    }

    fn handle_command(&mut self, cmd: GossipCommand) {
        match cmd {
            GossipCommand::FirstView(entries) => {
                self.engine.handle_first_view(entries);
                let _ = self
                    .events
                    .send(GossipEvent::ViewUpdate(self.engine.view().entries().to_vec()));
            }
            GossipCommand::RequestExchange { from, view } => {
                let reply = self.engine.handle_request_exchange(&from, view);
                let _ = self.events.send(GossipEvent::Outbound(reply));
                let _ = self
                    .events
                    .send(GossipEvent::ViewUpdate(self.engine.view().entries().to_vec()));
            }
            GossipCommand::AnswerRequest { view } => {
                self.engine.handle_answer_request(view);
                let _ = self
                    .events
                    .send(GossipEvent::ViewUpdate(self.engine.view().entries().to_vec()));
            }
            GossipCommand::DescriptorUpdate { path, value } => {
                self.engine.handle_descriptor_update(path, value);
            }
            GossipCommand::RecordBandwidth(sample) => {
                trace!(sample, "recording bandwidth sample");
                self.engine.record_bandwidth(sample);
            }
        }
    }

    fn publish_snapshot(&self) {
        *self.max_connections.write() = self.engine.max_connections();
        *self.view_size.write() = self.engine.view().len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor_with_bw(id: &str, bw: f64) -> NodeDescriptor {
        let mut d = NodeDescriptor::new(id);
        d.set_bandwidth(bw);
        d
    }

    #[test]
    fn view_merge_keeps_newer_age() {
        let mut view = View::new(10);
        let mut old = NodeDescriptor::new("p1");
        old.age = 1;
        view.replace(vec![old]);

        let mut newer = NodeDescriptor::new("p1");
        newer.age = 5;
        view.merge(vec![newer]);

        assert_eq!(view.entries()[0].age, 5);
    }

    #[test]
    fn view_respects_capacity_on_merge() {
        let mut view = View::new(2);
        view.merge(vec![
            NodeDescriptor::new("a"),
            NodeDescriptor::new("b"),
            NodeDescriptor::new("c"),
        ]);
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn descriptor_patch_writes_nested_path() {
        let mut d = NodeDescriptor::new("p1");
        d.apply_patch(
            &["media".to_string(), "bandwidth".to_string()],
            json!(42.0),
        );
        assert_eq!(d.bandwidth(), Some(42.0));
    }

    #[test]
    fn max_connections_without_bandwidth_data_is_log_of_view_size() {
        let mut engine = GossipEngine::new("self", GossipConfig::default());
        engine.handle_first_view(vec![
            NodeDescriptor::new("a"),
            NodeDescriptor::new("b"),
            NodeDescriptor::new("c"),
        ]);
        let expected = ((3.0_f64 + 1.0).ln()).ceil() as usize;
        assert_eq!(engine.max_connections(), expected);
    }

    #[test]
    fn max_connections_scales_with_relative_bandwidth() {
        let mut engine = GossipEngine::new("self", GossipConfig::default());
        engine.handle_first_view(vec![descriptor_with_bw("a", 10.0), descriptor_with_bw("b", 10.0)]);
        engine.record_bandwidth(40.0); // our own bandwidth far exceeds view mean
        assert!(engine.max_connections() > 0);
    }

    #[test]
    fn weight_request_heavy_admits_below_cap() {
        let decision = decide_weight(WeightAction::RequestHeavy, false, 1, 3);
        assert_eq!(decision, WeightDecision::AdmitHeavy);
    }

    #[test]
    fn weight_request_heavy_denied_at_cap() {
        let decision = decide_weight(WeightAction::RequestHeavy, false, 3, 3);
        assert_eq!(decision, WeightDecision::DenyHeavy);
    }

    #[test]
    fn weight_request_light_always_downgrades() {
        assert_eq!(
            decide_weight(WeightAction::RequestLight, true, 5, 1),
            WeightDecision::DowngradeToLight
        );
    }

    #[test]
    fn weight_noack_is_noop() {
        assert_eq!(
            decide_weight(WeightAction::NoackHeavy, false, 0, 5),
            WeightDecision::NoOp
        );
    }

    #[test]
    fn descriptor_update_command_reflects_into_view() {
        let mut engine = GossipEngine::new("self", GossipConfig::default());
        engine.handle_descriptor_update(
            vec!["media".to_string(), "bandwidth".to_string()],
            json!(7.0),
        );
        assert!(engine
            .view()
            .entries()
            .iter()
            .any(|d| d.id == "self" && d.bandwidth() == Some(7.0)));
    }
}
