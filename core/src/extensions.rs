//! # Extensions registrar
//!
//! spec.md §4.8 describes a mixin mechanism: a list of factories, each
//! invoked with the Peer Core as receiver, that may install additional
//! message handlers, methods, and fields. Rust has no dynamic
//! mixin-into-self mechanism, so per the REDESIGN FLAGS (§9) this becomes
//! an explicit capability interface: two small traits the
//! [`crate::router::Router`] feature-tests for at the two points spec.md
//! actually needs extension behavior —
//!
//! - [`HeavyPolicy`]: "is this message heavy, and how many heavy
//!   connections are we currently allowed" — installed when the media
//!   layer cares about bulk-transfer admission.
//! - [`GossipControl`]: the view/weight-protocol surface the router needs
//!   to talk to the gossip worker — installed when gossip is configured.
//! - [`RoutingObserver`]: lets an embedder count routed/broadcast messages
//!   for its own metrics without `meshcast-core` depending on a metrics
//!   crate directly.
//!
//! The Peer Core must not require any of these to be present (§4.8);
//! routing falls back to non-heavy, non-gossip-aware, unobserved behavior
//! when they're absent.

use crate::message::Message;

/// Declares which messages require bulk-transfer (heavy-connection)
/// admission before they can be routed directly, and how many heavy
/// connections this node is currently permitted.
pub trait HeavyPolicy: Send + Sync {
    /// True if `message` should only be sent over a connection whose
    /// incoming weight toward `message.to` is `Heavy`.
    fn is_heavy(&self, message: &Message) -> bool;

    /// Current admission cap for heavy incoming connections
    /// (spec.md §4.6 `max_connections`).
    fn max_connections(&self) -> usize;
}

/// The router-facing surface of the gossip engine: requesting a weight
/// upgrade/downgrade and reading back the outcome. The actual view
/// maintenance and weight-protocol message handling live in
/// [`crate::gossip`]; this trait is what lets the router stay ignorant of
/// gossip's internals while still being able to ask "do I have a heavy
/// slot for this peer".
pub trait GossipControl: Send + Sync {
    /// Size of the current view (used by callers that want to log or
    /// expose network-size metrics without depending on `gossip` directly).
    fn view_size(&self) -> usize;

    /// Hands a `first-view`/`gossip:*` wire message to the gossip worker.
    /// This is the install point §4.8 describes: the router never parses
    /// gossip payloads itself, it just routes the tagged types here.
    fn handle_gossip_message(&self, message: Message);
}

/// Counts routing activity for an embedder's metrics. The router calls
/// this on every routing decision and every broadcast fallback if one is
/// installed; absent, routing behaves exactly as if it were never called.
pub trait RoutingObserver: Send + Sync {
    /// A message went through the routing decision in `process_message`.
    fn message_routed(&self);

    /// A message was actually delivered (or handed to the rendezvous) via
    /// sender-excluded broadcast.
    fn message_broadcast(&self);
}

/// A Peer Core's optional extensions. Absent fields mean "behave as if
/// that extension were never installed" — see each field's trait docs.
#[derive(Default, Clone)]
pub struct Extensions {
    pub heavy_policy: Option<std::sync::Arc<dyn HeavyPolicy>>,
    pub gossip: Option<std::sync::Arc<dyn GossipControl>>,
    pub routing_observer: Option<std::sync::Arc<dyn RoutingObserver>>,
}

impl Extensions {
    /// No extensions installed.
    pub fn none() -> Self {
        Self::default()
    }

    /// Installs a [`HeavyPolicy`], returning `self` for chaining.
    pub fn with_heavy_policy(mut self, policy: std::sync::Arc<dyn HeavyPolicy>) -> Self {
        self.heavy_policy = Some(policy);
        self
    }

    /// Installs a [`GossipControl`], returning `self` for chaining.
    pub fn with_gossip(mut self, gossip: std::sync::Arc<dyn GossipControl>) -> Self {
        self.gossip = Some(gossip);
        self
    }

    /// Installs a [`RoutingObserver`], returning `self` for chaining.
    pub fn with_routing_observer(mut self, observer: std::sync::Arc<dyn RoutingObserver>) -> Self {
        self.routing_observer = Some(observer);
        self
    }
}
