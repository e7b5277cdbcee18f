//! # Overlay Configuration & Constants
//!
//! Every magic number the router, gossip engine, and media manager lean on
//! lives here. Message framing, timeouts, and sentinel values are wire
//! contract — changing them breaks interop with peers running an older
//! build, so treat this module the way you'd treat a protocol version bump.

use std::time::Duration;

/// Reserved `to` value meaning "the rendezvous service".
pub const SIGNAL: &str = "signal";

/// Reserved `to` value meaning "the origin media server".
pub const SOURCE: &str = "source";

/// Reserved `to` value meaning "any peer" — used with `request-peer`.
/// spec.md leaves the string-vs-integer form of this sentinel an open
/// question; we pick the string form since `Message::to` is a `String`
/// everywhere else and a mixed-type field would need its own enum for
/// zero benefit.
pub const ANY_PEER: &str = "-1";

/// Default hop budget for a freshly constructed message.
pub const DEFAULT_TTL: u8 = 3;

/// How often the Peer Core runs its queue/connection maintenance sweep.
pub const QUEUE_TIMEOUT: Duration = Duration::from_millis(1000);

/// A connection idle longer than this (no activity) is closed at the next
/// maintenance tick.
pub const CONNECTION_INACTIVITY_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Interval at which the Signal Client emits a `signal:keepalive` to
/// prevent a rendezvous endpoint that idles out (~30s) from dropping us.
pub const SIGNAL_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(30_000);

/// Message types eligible for flood-broadcast when no direct route exists.
pub const FORWARDABLE_TYPES: &[&str] = &["icecandidate", "request-peer", "offer", "answer"];

/// Returns true if `msg_type` is one of [`FORWARDABLE_TYPES`].
pub fn is_forwardable(msg_type: &str) -> bool {
    FORWARDABLE_TYPES.contains(&msg_type)
}

/// Default number of parts to request from peers per `next_parts_to_download` call.
pub const DEFAULT_DOWNLOAD_BATCH: usize = 5;

/// Default maximum transport datagram chunk size, in bytes, used when
/// splitting a part's buffer for chunked delivery.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
