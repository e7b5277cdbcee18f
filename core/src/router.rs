//! # Peer Core / Router
//!
//! Owns the Connection Table, ICE Candidate Buffer, outbound queue, and
//! Message Emitter. Implements send/broadcast/forward, the handshake
//! bring-up over the overlay itself, the weight protocol's connection-table
//! side, and the periodic queue/connection maintenance sweep (spec.md
//! §4.2).
//!
//! Everything here runs cooperatively: no method holds a lock across an
//! `.await`. Suspension points are exactly the transport calls and the
//! maintenance ticker, matching the single-threaded scheduling model of
//! spec.md §5.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config;
use crate::connection::{Connection, ConnectionTable, Weight};
use crate::emitter::Emitter;
use crate::error::RouterError;
use crate::extensions::Extensions;
use crate::gossip::{decide_weight, GossipEvent, NodeDescriptor, WeightAction, WeightDecision};
use crate::ice::IceBuffer;
use crate::message::{Message, PeerId, Payload, QueuedMessage};
use crate::transport::{ConnectionState, RendezvousChannel, Transport};

/// Creates a [`Transport`] toward a not-yet-connected peer. The concrete
/// implementation (real WebRTC, loopback, …) is the embedder's choice; the
/// router only needs to be able to ask for one (spec.md §4.2's
/// "create a new Transport Adapter toward `from`").
pub trait TransportFactory: Send + Sync {
    fn create(&self, remote_id: &str) -> Arc<dyn Transport>;
}

/// The Peer Core. One instance per process (spec.md §3 lifecycle).
pub struct Router {
    self_id: RwLock<PeerId>,
    ttl: u8,
    connections: Mutex<ConnectionTable>,
    ice: Mutex<IceBuffer>,
    queue: Mutex<Vec<QueuedMessage>>,
    emitter: Mutex<Emitter>,
    extensions: Extensions,
    rendezvous: Arc<dyn RendezvousChannel>,
    transport_factory: Arc<dyn TransportFactory>,
    last_view: RwLock<Vec<NodeDescriptor>>,
}

impl Router {
    /// Builds a Router with no identity yet — `self_id` is adopted from the
    /// rendezvous's `first-view` message, per spec.md §4.2.
    pub fn new(
        rendezvous: Arc<dyn RendezvousChannel>,
        transport_factory: Arc<dyn TransportFactory>,
        extensions: Extensions,
    ) -> Self {
        Self {
            self_id: RwLock::new(String::new()),
            ttl: config::DEFAULT_TTL,
            connections: Mutex::new(ConnectionTable::new()),
            ice: Mutex::new(IceBuffer::new()),
            queue: Mutex::new(Vec::new()),
            emitter: Mutex::new(Emitter::new()),
            extensions,
            rendezvous,
            transport_factory,
            last_view: RwLock::new(Vec::new()),
        }
    }

    /// This node's current id, or the empty string before `first-view`.
    pub fn id(&self) -> PeerId {
        self.self_id.read().clone()
    }

    /// Registers a handler for `msg_type` on the emitter (the install point
    /// for extensions and application-level handlers, spec.md §4.8 — the
    /// handshake/gossip/weight types below are handled by the router itself
    /// and never reach the emitter).
    pub fn subscribe(&self, msg_type: impl Into<String>, handler: crate::emitter::Handler) {
        self.emitter.lock().subscribe(msg_type, handler);
    }

    /// Current queue length, for diagnostics.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// The most recent gossip view snapshot, if a gossip worker is wired up
    /// via [`Self::spawn_gossip_event_loop`].
    pub fn last_view(&self) -> Vec<NodeDescriptor> {
        self.last_view.read().clone()
    }

    /// Number of entries in the Connection Table, open or not. For
    /// diagnostics only; does not itself purge closed connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Number of connections currently in the `Open` state.
    pub fn open_connection_count(&self) -> usize {
        self.connections.lock().open_peers().count()
    }

    /// Peer-ids of every connection currently in the `Open` state, for
    /// callers that want to diff successive snapshots (e.g. to synthesize
    /// connect/disconnect events).
    pub fn open_peer_ids(&self) -> Vec<PeerId> {
        self.connections.lock().open_peers().map(|c| c.remote_id.clone()).collect()
    }

    // -- egress -------------------------------------------------------

    /// Primary egress (spec.md §4.2). Local loopback if `to == self.id()`,
    /// otherwise enters the routing decision.
    pub async fn send(
        &self,
        message: Message,
        timeout: Option<Duration>,
        on_timeout: Option<Box<dyn FnOnce(Message) + Send>>,
    ) -> Result<(), RouterError> {
        message.validate()?;
        if message.to == self.id() {
            self.emitter.lock().dispatch(message);
            return Ok(());
        }
        let queued = QueuedMessage::new(message, timeout, on_timeout);
        let mut requeued = Vec::new();
        self.process_message(queued, &mut requeued).await;
        self.queue.lock().extend(requeued);
        Ok(())
    }

    /// `request_peer(to="-1")`: solicits a session with any peer.
    pub async fn request_peer(
        &self,
        timeout: Option<Duration>,
        on_timeout: Option<Box<dyn FnOnce(Message) + Send>>,
    ) -> Result<(), RouterError> {
        let message = Message::new("request-peer", self.id(), config::ANY_PEER).with_ttl(self.ttl);
        self.send(message, timeout, on_timeout).await
    }

    /// Builds a reply to `original`: `from=self`, `to=original.from`,
    /// fresh `ttl`, empty `forward_by`, and `route` seeded from
    /// `original.forward_by` for reverse-path delivery.
    pub fn respond_to(&self, original: &Message, type_: impl Into<String>, data: Payload) -> Message {
        Message {
            type_: type_.into(),
            from: self.id(),
            to: original.from.clone(),
            ttl: self.ttl,
            forward_by: Vec::new(),
            route: original.forward_by.clone(),
            data,
        }
    }

    /// Decrements ttl, records this node as a hop, and sends onward. A
    /// ttl-exhausted message is silently dropped, never forwarded (the
    /// invariant spec.md §3 and §8 both require).
    pub async fn forward(&self, message: Message) -> Result<(), RouterError> {
        let self_id = self.id();
        match message.forwarded_by(&self_id) {
            Some(forwarded) => self.send(forwarded, None, None).await,
            None => {
                debug!(msg_type = %message.type_, "dropping ttl-exhausted message instead of forwarding");
                Ok(())
            }
        }
    }

    /// Sender-excluded flood over every open connection. Falls back to the
    /// rendezvous when this node originated the message and no neighbor
    /// took a copy. Returns true iff at least one copy left the node.
    pub async fn broadcast(&self, message: Message) -> bool {
        let excluded: std::collections::HashSet<&str> = message
            .forward_by
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(message.from.as_str()))
            .collect();

        let targets: Vec<Arc<dyn Transport>> = {
            let table = self.connections.lock();
            table
                .open_peers()
                .filter(|c| !excluded.contains(c.remote_id.as_str()))
                .map(|c| c.transport.clone())
                .collect()
        };

        let mut sent = 0usize;
        for transport in &targets {
            if transport.send(message.clone()).await.is_ok() {
                sent += 1;
            }
        }
        if sent > 0 {
            if let Some(observer) = &self.extensions.routing_observer {
                observer.message_broadcast();
            }
            return true;
        }
        if message.from != self.id() {
            return false;
        }
        let delivered = self.broadcast_fallback_to_rendezvous(message).await;
        if delivered {
            if let Some(observer) = &self.extensions.routing_observer {
                observer.message_broadcast();
            }
        }
        delivered
    }

    async fn broadcast_fallback_to_rendezvous(&self, message: Message) -> bool {
        match self.rendezvous.state() {
            ConnectionState::Open => self.rendezvous.send(message).await.is_ok(),
            ConnectionState::Closing | ConnectionState::Closed => {
                warn!("rendezvous unavailable during broadcast fallback, reconnecting");
                let _ = self.rendezvous.reconnect().await;
                false
            }
            ConnectionState::Connecting => false,
        }
    }

    // -- routing decision ----------------------------------------------

    /// `process_message`: the five-step routing decision of spec.md §4.2.
    ///
    /// Step 1 (heavy admission) is checked unconditionally before step 2
    /// (direct neighbor), even when the destination is already an open
    /// light neighbor — per the open-question resolution recorded in
    /// SPEC_FULL.md §12, this delays latency-insensitive heavy traffic by
    /// at least one maintenance tick rather than silently upgrading the
    /// existing connection on the caller's behalf.
    async fn process_message(&self, mut queued: QueuedMessage, out_queue: &mut Vec<QueuedMessage>) {
        if let Some(observer) = &self.extensions.routing_observer {
            observer.message_routed();
        }

        let to = queued.message.to.clone();

        if let Some(policy) = self.extensions.heavy_policy.clone() {
            if policy.is_heavy(&queued.message) && to != config::SIGNAL && to != config::SOURCE {
                let admitted = {
                    let table = self.connections.lock();
                    table
                        .get(&to)
                        .is_some_and(|c| c.state().is_open() && matches!(c.weight.incoming, Weight::Heavy))
                };
                if admitted {
                    if self.send_direct(&to, queued.message.clone()).await {
                        return;
                    }
                } else {
                    let request = Message::new("gossip:weight", self.id(), to.clone())
                        .with_ttl(self.ttl)
                        .with_data(json!({ "action": WeightAction::RequestHeavy }));
                    self.send_best_effort(request).await;
                    out_queue.push(queued);
                    return;
                }
            }
        }

        if self.send_direct(&to, queued.message.clone()).await {
            return;
        }

        if !queued.message.route.is_empty() {
            let head = queued.message.route[0].clone();
            let head_is_open = { self.connections.lock().is_open_neighbor(&head) };
            if head_is_open {
                queued.message.route.remove(0);
                if self.send_direct(&head, queued.message.clone()).await {
                    return;
                }
            }
        }

        if config::is_forwardable(&queued.message.type_) && self.broadcast(queued.message.clone()).await {
            return;
        }

        self.requeue(queued, out_queue);
    }

    async fn send_direct(&self, to: &str, message: Message) -> bool {
        let transport = {
            let table = self.connections.lock();
            table
                .get(to)
                .filter(|c| c.state().is_open())
                .map(|c| c.transport.clone())
        };
        let Some(transport) = transport else { return false };
        let ok = transport.send(message).await.is_ok();
        if ok {
            if let Some(c) = self.connections.lock().get_mut(to) {
                c.touch();
            }
        }
        ok
    }

    /// Fire-and-forget attempt used for control traffic (the heavy-request
    /// nudge) that must not itself recurse through the full queue pipeline.
    async fn send_best_effort(&self, message: Message) {
        if self.send_direct(&message.to, message.clone()).await {
            return;
        }
        if config::is_forwardable(&message.type_) {
            let _ = self.broadcast(message).await;
        }
    }

    /// §4.2 re-queue policy.
    fn requeue(&self, queued: QueuedMessage, out_queue: &mut Vec<QueuedMessage>) {
        let to = queued.message.to.clone();
        if to == config::SIGNAL || to == config::SOURCE {
            out_queue.push(queued);
            return;
        }
        if queued.message.type_ == "request-peer" {
            let duplicate = out_queue.iter().any(|e| {
                e.message.type_ == "request-peer" && e.message.from == queued.message.from && e.message.to == to
            });
            if !duplicate {
                out_queue.push(queued);
            }
            return;
        }

        let already_soliciting = out_queue
            .iter()
            .any(|e| e.message.type_ == "request-peer" && e.message.to == to);
        out_queue.push(queued);
        if !already_soliciting {
            let solicit = Message::new("request-peer", self.id(), to).with_ttl(self.ttl);
            out_queue.push(QueuedMessage::new(solicit, None, None));
        }
    }

    // -- handshake --------------------------------------------------------

    /// Core dispatcher: handles routing/handshake/gossip types inline,
    /// delegates everything else to the Emitter for extension handlers
    /// (media, application-level types) to pick up.
    pub async fn handle_message(&self, message: Message) {
        match message.type_.as_str() {
            "request-peer" => self.handle_request_peer(message).await,
            "offer" => self.handle_offer(message).await,
            "answer" => self.handle_answer(message).await,
            "icecandidate" => self.handle_icecandidate(message).await,
            "first-view" => self.handle_first_view(message),
            "gossip:weight" => self.handle_weight(message).await,
            "gossip:view-update" => {
                debug!("ignoring inbound gossip:view-update; this type only crosses the internal worker channel");
            }
            "connected" => {
                debug!("ignoring inbound \"connected\"; it is an internal-only event");
            }
            t if t.starts_with("gossip:") => {
                if let Some(gossip) = &self.extensions.gossip {
                    gossip.handle_gossip_message(message);
                }
            }
            _ => self.emitter.lock().dispatch(message),
        }
    }

    async fn handle_request_peer(&self, message: Message) {
        let from = message.from.clone();
        if from.is_empty() || from == self.id() {
            return;
        }
        if self.connections.lock().contains(&from) {
            return;
        }
        let transport = self.transport_factory.create(&from);
        self.connections.lock().insert(Connection::new(from.clone(), transport.clone()));
        if transport.create_channel().await.is_err() {
            return;
        }
        match transport.create_sdp_offer().await {
            Ok(offer) => {
                let reply = self.respond_to(&message, "offer", json!({ "sdp": offer }));
                let _ = self.send(reply, None, None).await;
            }
            Err(err) => warn!(peer = %from, error = %err, "sdp offer creation failed"),
        }
    }

    async fn handle_offer(&self, message: Message) {
        let from = message.from.clone();
        let remote_sdp = message
            .data
            .get("sdp")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let transport = self.transport_factory.create(&from);
        self.connections.lock().insert(Connection::new(from.clone(), transport.clone()));

        match transport.create_sdp_answer(remote_sdp).await {
            Ok(answer) => {
                let reply = self.respond_to(&message, "answer", json!({ "sdp": answer }));
                let _ = self.send(reply, None, None).await;

                let pending = self.ice.lock().drain(&from);
                for candidate in pending {
                    if let Err(err) = transport.add_ice_candidate(candidate).await {
                        warn!(peer = %from, error = %err, "buffered ice candidate rejected");
                    }
                }
            }
            Err(err) => warn!(peer = %from, error = %err, "sdp answer creation failed"),
        }
    }

    async fn handle_answer(&self, message: Message) {
        let from = message.from.clone();
        let sdp = message
            .data
            .get("sdp")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let transport = {
            let table = self.connections.lock();
            table.get(&from).map(|c| (c.transport.clone(), c.state()))
        };
        match transport {
            Some((t, ConnectionState::Connecting)) => {
                if let Err(err) = t.set_remote_description(sdp).await {
                    warn!(peer = %from, error = %err, "failed to apply remote description");
                }
            }
            Some((_, state)) => {
                let err = RouterError::HandshakeMismatch {
                    peer: from.clone(),
                    state: format!("{:?}", state),
                };
                warn!(peer = %from, error = %err, "handshake mismatch");
            }
            None => warn!(peer = %from, "answer received for unknown connection"),
        }
    }

    async fn handle_icecandidate(&self, message: Message) {
        let from = message.from.clone();
        let candidate = message
            .data
            .get("candidate")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let transport = {
            let table = self.connections.lock();
            table.get(&from).map(|c| c.transport.clone())
        };
        match transport {
            Some(t) => {
                if let Err(err) = t.add_ice_candidate(candidate).await {
                    warn!(peer = %from, error = %err, "ice candidate rejected");
                }
            }
            None => self.ice.lock().push(&from, candidate),
        }
    }

    fn handle_first_view(&self, message: Message) {
        if let Some(id) = message.data.get("id").and_then(Value::as_str) {
            info!(self_id = id, "adopted identity from rendezvous first-view");
            *self.self_id.write() = id.to_string();
        }
        if let Some(gossip) = &self.extensions.gossip {
            gossip.handle_gossip_message(message);
        }
    }

    async fn handle_weight(&self, message: Message) {
        let from = message.from.clone();
        let action: Option<WeightAction> = message
            .data
            .get("action")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        let Some(action) = action else {
            warn!(peer = %from, "gossip:weight message missing a recognized action");
            return;
        };

        let max_connections = self
            .extensions
            .heavy_policy
            .as_ref()
            .map(|p| p.max_connections())
            .unwrap_or(0);
        let (incoming_is_heavy, heavy_count) = {
            let table = self.connections.lock();
            let incoming_is_heavy = table.get(&from).is_some_and(|c| matches!(c.weight.incoming, Weight::Heavy));
            (incoming_is_heavy, table.heavy_incoming_count())
        };

        let decision = decide_weight(action, incoming_is_heavy, heavy_count, max_connections);
        self.apply_weight_decision(decision, &from).await;
    }

    async fn apply_weight_decision(&self, decision: WeightDecision, peer: &str) {
        match decision {
            WeightDecision::AdmitHeavy => {
                self.set_incoming_weight(peer, Weight::Heavy);
                self.reply_weight(peer, WeightAction::AckHeavy).await;
            }
            WeightDecision::DenyHeavy => {
                self.reply_weight(peer, WeightAction::NoackHeavy).await;
            }
            WeightDecision::DowngradeToLight => {
                self.set_incoming_weight(peer, Weight::Light);
                self.reply_weight(peer, WeightAction::AckLight).await;
            }
            WeightDecision::ConfirmOutgoingHeavy => {
                self.set_outgoing_weight(peer, Weight::Heavy);
            }
            WeightDecision::ConfirmOutgoingLight => {
                self.set_outgoing_weight(peer, Weight::Light);
            }
            WeightDecision::NoOp => {}
        }
    }

    fn set_incoming_weight(&self, peer: &str, weight: Weight) {
        if let Some(c) = self.connections.lock().get_mut(peer) {
            c.weight.incoming = weight;
        }
    }

    fn set_outgoing_weight(&self, peer: &str, weight: Weight) {
        if let Some(c) = self.connections.lock().get_mut(peer) {
            c.weight.outgoing = weight;
        }
    }

    async fn reply_weight(&self, peer: &str, action: WeightAction) {
        let reply = Message::new("gossip:weight", self.id(), peer.to_string())
            .with_ttl(self.ttl)
            .with_data(json!({ "action": action }));
        let _ = self.send(reply, None, None).await;
    }

    // -- maintenance ---------------------------------------------------

    /// Resend the matching queue entries immediately once a transport to
    /// `remote_id` reports `open` (spec.md §4.2 "on channel open").
    pub async fn on_connected(&self, remote_id: &str) {
        let transport = {
            let table = self.connections.lock();
            table.get(remote_id).map(|c| c.transport.clone())
        };
        let Some(transport) = transport else { return };

        let matching: Vec<QueuedMessage> = {
            let mut q = self.queue.lock();
            let (matching, rest): (Vec<_>, Vec<_>) = q.drain(..).partition(|e| e.message.to == remote_id);
            *q = rest;
            matching
        };
        for entry in matching {
            let _ = transport.send(entry.message).await;
        }
    }

    /// Periodic queue/connection maintenance (spec.md §4.2, default
    /// interval [`config::QUEUE_TIMEOUT`]).
    pub async fn run_maintenance(&self) {
        let now = Instant::now();

        let expired: Vec<QueuedMessage> = {
            let mut q = self.queue.lock();
            let mut i = 0;
            let mut out = Vec::new();
            while i < q.len() {
                if q[i].is_expired(now) {
                    out.push(q.remove(i));
                } else {
                    i += 1;
                }
            }
            out
        };
        for entry in expired {
            if let Some(callback) = entry.on_timeout {
                callback(entry.message);
            }
        }

        let survivors: Vec<QueuedMessage> = self.queue.lock().drain(..).collect();
        let mut fresh_queue = Vec::new();
        for queued in survivors {
            self.process_message(queued, &mut fresh_queue).await;
        }
        *self.queue.lock() = fresh_queue;

        let idle_peers = {
            let table = self.connections.lock();
            table.idle_peers(config::CONNECTION_INACTIVITY_TIMEOUT, now)
        };
        for peer in idle_peers {
            let transport = {
                let table = self.connections.lock();
                table.get(&peer).map(|c| c.transport.clone())
            };
            if let Some(t) = transport {
                t.close().await;
            }
        }
        self.connections.lock().purge_closed();
    }

    /// Spawns a background task that drains gossip worker events: outbound
    /// messages are routed through `send`, view updates are cached in
    /// `last_view` (spec.md §5 — the Peer Core only caches a snapshot, it
    /// never holds the view mutably).
    pub fn spawn_gossip_event_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<GossipEvent>) {
        let router = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    GossipEvent::Outbound(message) => {
                        let _ = router.send(message, None, None).await;
                    }
                    GossipEvent::ViewUpdate(entries) => {
                        *router.last_view.write() = entries;
                    }
                }
            }
        });
    }
}
