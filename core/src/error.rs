//! Error types for the overlay engine.
//!
//! Each component surfaces failures through one of these enums rather than
//! a single crate-wide error — the caller of `Router::send` and the caller
//! of `MediaManager::append` care about very different failure modes, and
//! collapsing them into one type would force both sides to match on
//! variants that can't occur for them.

use thiserror::Error;

/// Errors surfaced by [`crate::router::Router`] routing and handshake logic.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A message was missing a required field for its type (§6).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// No route, no open neighbor, and the rendezvous is unavailable.
    #[error("no route to destination {to}")]
    UnknownDestination {
        /// The destination that could not be reached.
        to: String,
    },

    /// An `answer` arrived for a peer whose connection was not in
    /// `connecting` state. Logged as an assertion failure; the message is
    /// dropped, not propagated as a hard error, but callers that want to
    /// observe it can match on this variant.
    #[error("handshake mismatch: received answer from {peer} while connection was {state}")]
    HandshakeMismatch {
        /// The peer the out-of-order `answer` came from.
        peer: String,
        /// The connection state actually observed.
        state: String,
    },
}

/// Errors surfaced by [`crate::media::MediaManager`].
#[derive(Debug, Error)]
pub enum MediaError {
    /// `append` was called for a part whose status was not `pending`.
    #[error("unexpected append for part {part} (status was {status})")]
    UnexpectedPart {
        /// The part number that was appended to.
        part: u32,
        /// The status observed when the append was rejected.
        status: String,
    },

    /// The computed digest did not match the one the segment index
    /// advertised for this part. Non-fatal per spec.md §7 — the part is
    /// left `added`; this variant exists so the embedding harness can log
    /// or surface it.
    #[error("digest mismatch for part {part}: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The part whose digest failed to verify.
        part: u32,
        /// The digest advertised by the segment index, hex-encoded.
        expected: String,
        /// The digest actually computed, hex-encoded.
        actual: String,
    },

    /// `set_metadata` was called more than once; the segment index is
    /// immutable after it is first set (§3).
    #[error("segment index already set")]
    MetadataAlreadySet,

    /// Referenced a part number outside the bounds of the segment index.
    #[error("part {0} out of range")]
    PartOutOfRange(u32),
}

/// Errors a [`crate::transport::Transport`] implementation reports back
/// through its callbacks (SDP creation, remote-description application,
/// candidate application, playback append).
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// SDP offer/answer creation failed.
    #[error("sdp negotiation failed: {0}")]
    SdpFailed(String),

    /// `add_ice_candidate` failed.
    #[error("ice candidate rejected: {0}")]
    IceRejected(String),

    /// The playback sink rejected an appended buffer.
    #[error("playback append failed: {0}")]
    AppendFailed(String),

    /// The transport channel closed before the operation completed.
    #[error("transport closed mid-operation")]
    Closed,
}
