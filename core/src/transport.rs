//! # Transport Adapter capability
//!
//! The router doesn't know or care whether a connection is a WebRTC
//! DataChannel, a raw TCP socket, or an in-memory loopback — it only needs
//! the capability described here (spec.md §4.3, §9). Three abstract traits
//! replace the browser-specific pieces the original design depended on:
//!
//! - [`Transport`]: a pairwise, bidirectional, message-oriented channel
//!   with the `connecting -> open -> (closing)? -> closed` state machine.
//! - [`RendezvousChannel`]: the special always-on channel toward the
//!   signal service (implemented by [`crate::signal::SignalClient`]).
//! - [`Digest`]: content-hash verification, kept pluggable so embedders
//!   can swap in a hardware-accelerated implementation.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::message::Message;

/// Lifecycle state of a [`Transport`]. Strictly monotonic — no re-opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Handshake in progress; not yet able to carry application traffic.
    Connecting,
    /// Ready to send and receive.
    Open,
    /// Teardown initiated but not yet complete.
    Closing,
    /// Fully torn down. Terminal — a closed transport is never reused.
    Closed,
}

impl ConnectionState {
    /// True once the channel can carry application messages.
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

/// A session description, produced by `create_sdp_offer`/`create_sdp_answer`
/// and consumed by `set_remote_description`. Kept as an opaque string — the
/// router never inspects the contents, only shuttles it between peers.
pub type SessionDescription = String;

/// An ICE-like connectivity candidate. Opaque to the router.
pub type IceCandidate = String;

/// Capability required of a per-peer bidirectional channel.
///
/// Implementations are expected to invoke the router's dispatcher on
/// `on_message` and to update connection-table state on `on_state_change`;
/// this trait models only the call surface the router needs, not the
/// callback wiring itself (that's the embedder's job, matching spec.md's
/// note that timing between `create_sdp_offer` completion and channel
/// `open` must not be assumed).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Sends `message` over this channel. Implementations should not block
    /// on delivery confirmation; per-connection ordering (FIFO) is the
    /// only guarantee the router relies on.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Opens the underlying datagram channel (offering side only).
    async fn create_channel(&self) -> Result<(), TransportError>;

    /// Produces a local session description to send as an `offer`.
    async fn create_sdp_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Produces a local session description to send as an `answer`, given
    /// the remote's offer.
    async fn create_sdp_answer(
        &self,
        remote_sdp: SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    /// Applies a remote session description (the other side's offer or
    /// answer) to this transport.
    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), TransportError>;

    /// Applies a remote ICE-like candidate.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Begins graceful teardown. `state()` transitions to `Closing` then
    /// `Closed`; never back to `Connecting`/`Open`.
    async fn close(&self);
}

/// Capability required of the rendezvous (signal) channel. A
/// `RendezvousChannel` is always exactly one instance per Peer Core,
/// keyed in the connection table under [`crate::config::SIGNAL`].
#[async_trait]
pub trait RendezvousChannel: Send + Sync {
    /// Current lifecycle state, mirroring [`Transport::state`].
    fn state(&self) -> ConnectionState;

    /// Sends `message` to the rendezvous service. `ttl` is forced to 0
    /// before framing, per spec.md §6.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Replaces the underlying connection (used when the router observes
    /// the rendezvous channel in `Closing`/`Closed` during a broadcast
    /// fallback attempt).
    async fn reconnect(&self) -> Result<(), TransportError>;
}

/// Capability for verifying a part's content digest against the value the
/// segment index advertised for it (spec.md §4.7, `DigestMismatch`).
pub trait Digest: Send + Sync {
    /// Computes the digest of `bytes` and returns it hex-encoded.
    fn compute(&self, bytes: &[u8]) -> String;
}

/// The crate's default [`Digest`]: SHA-256, hex-encoded.
pub struct Sha256Digest;

impl Digest for Sha256Digest {
    fn compute(&self, bytes: &[u8]) -> String {
        use sha2::{Digest as _, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex_encode(&hasher.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}
