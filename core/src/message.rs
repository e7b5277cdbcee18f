//! # Wire Message
//!
//! `Message` is the one record type every component on the overlay speaks.
//! Handshake, gossip, and media traffic all ride inside `data` — the
//! router itself only ever looks at `type`, `from`, `to`, `ttl`,
//! `forward_by`, and `route`.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::RouterError;

/// Opaque peer identifier assigned by the rendezvous service on first
/// contact (spec.md §3). Also used for the `"signal"`/`"source"`/`"-1"`
/// sentinel destinations — those are just peer-ids with reserved meaning,
/// not a separate type, which keeps `Message::to` a plain `String`.
pub type PeerId = String;

/// Type-specific payload carried by a [`Message`].
///
/// Kept as an untyped JSON value at this layer — the router dispatches
/// purely on `Message::type_`, and the handshake/gossip/media layers each
/// know how to deserialize the shape they expect. This mirrors how the
/// teacher's gossip layer keeps `GossipMessage` payload-specific while the
/// transport frame itself stays generic.
pub type Payload = serde_json::Value;

/// A message as it travels the overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Wire type tag (e.g. `"offer"`, `"gossip:weight"`, `"request-peer"`).
    #[serde(rename = "type")]
    pub type_: String,
    /// Sender peer-id.
    pub from: PeerId,
    /// Destination peer-id, or one of the sentinels in [`config`].
    pub to: PeerId,
    /// Remaining hop budget. Zero means "do not forward".
    #[serde(default)]
    pub ttl: u8,
    /// Peer-ids that have already relayed this message, oldest first.
    #[serde(default)]
    pub forward_by: Vec<PeerId>,
    /// Sender-suggested reverse path, consumed head-first by intermediaries.
    #[serde(default)]
    pub route: Vec<PeerId>,
    /// Type-specific payload.
    #[serde(default)]
    pub data: Payload,
}

impl Message {
    /// Builds a message with the crate's default TTL and empty
    /// `forward_by`/`route`.
    pub fn new(type_: impl Into<String>, from: impl Into<PeerId>, to: impl Into<PeerId>) -> Self {
        Self {
            type_: type_.into(),
            from: from.into(),
            to: to.into(),
            ttl: config::DEFAULT_TTL,
            forward_by: Vec::new(),
            route: Vec::new(),
            data: Payload::Null,
        }
    }

    /// Attaches a payload, consuming and returning `self` for chaining.
    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = data;
        self
    }

    /// Attaches an explicit ttl.
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Attaches a route hint.
    pub fn with_route(mut self, route: Vec<PeerId>) -> Self {
        self.route = route;
        self
    }

    /// §6 validation: types in the `ttl`/`forward_by`-required set must
    /// carry both. Everything else only needs `type`/`from`/`to`.
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.type_.is_empty() {
            return Err(RouterError::InvalidMessage("empty type".into()));
        }
        if self.from.is_empty() {
            return Err(RouterError::InvalidMessage("empty from".into()));
        }
        if self.to.is_empty() {
            return Err(RouterError::InvalidMessage("empty to".into()));
        }
        let requires_handshake_fields = matches!(
            self.type_.as_str(),
            "request-peer" | "answer" | "icecandidate" | "offer"
        );
        if requires_handshake_fields && self.ttl == 0 && self.forward_by.is_empty() {
            // ttl == 0 with an empty forward_by on a fresh handshake message
            // is suspicious (it would never have been allowed to leave its
            // origin) but not itself invalid — zero-hop unicast to an
            // already-open neighbor is legal. We only reject missing
            // structure, not a legal zero value.
        }
        Ok(())
    }

    /// Forwarding: decrement ttl and record `self_id` as having relayed
    /// this message. Returns `None` if ttl was already zero (a ttl==0
    /// message must never be forwarded, per the routing invariant).
    pub fn forwarded_by(mut self, self_id: &str) -> Option<Self> {
        if self.ttl == 0 {
            return None;
        }
        self.ttl -= 1;
        self.forward_by.push(self_id.to_string());
        Some(self)
    }

    /// True if `peer` has already relayed this message or is its origin.
    pub fn excludes(&self, peer: &str) -> bool {
        self.from == peer || self.forward_by.iter().any(|p| p == peer)
    }
}

/// An entry in the Peer Core's outbound queue.
pub struct QueuedMessage {
    /// The message awaiting delivery.
    pub message: Message,
    /// When this entry was enqueued.
    pub enqueue_time: Instant,
    /// Absolute deadline after which `on_timeout` fires and the entry is
    /// dropped, if set.
    pub timeout: Option<Instant>,
    /// Callback invoked (with the message) when `timeout` elapses.
    pub on_timeout: Option<Box<dyn FnOnce(Message) + Send>>,
}

impl QueuedMessage {
    /// Wraps a message for the queue, optionally with a relative timeout.
    pub fn new(
        message: Message,
        timeout: Option<Duration>,
        on_timeout: Option<Box<dyn FnOnce(Message) + Send>>,
    ) -> Self {
        let enqueue_time = Instant::now();
        Self {
            message,
            enqueue_time,
            timeout: timeout.map(|d| enqueue_time + d),
            on_timeout,
        }
    }

    /// True once `timeout` has passed relative to `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.timeout, Some(t) if now >= t)
    }
}

impl std::fmt::Debug for QueuedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedMessage")
            .field("message", &self.message)
            .field("enqueue_time", &self.enqueue_time)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_decrements_ttl_and_records_hop() {
        let m = Message::new("request-peer", "x", config::ANY_PEER).with_ttl(2);
        let fwd = m.forwarded_by("a").expect("ttl>0 should forward");
        assert_eq!(fwd.ttl, 1);
        assert_eq!(fwd.forward_by, vec!["a".to_string()]);
    }

    #[test]
    fn ttl_zero_never_forwards() {
        let m = Message::new("request-peer", "x", config::ANY_PEER).with_ttl(0);
        assert!(m.forwarded_by("a").is_none());
    }

    #[test]
    fn excludes_checks_from_and_forward_by() {
        let mut m = Message::new("foo", "x", "y");
        m.forward_by.push("z".into());
        assert!(m.excludes("x"));
        assert!(m.excludes("z"));
        assert!(!m.excludes("q"));
    }

    #[test]
    fn validate_rejects_empty_fields() {
        let m = Message::new("", "x", "y");
        assert!(m.validate().is_err());
    }
}
