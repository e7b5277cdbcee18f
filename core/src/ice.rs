//! # ICE Candidate Buffer
//!
//! Candidates can arrive before the Transport Adapter they belong to
//! exists — the remote may trickle an `icecandidate` ahead of its own
//! `offer`. This module is the arena of pending sessions that buffers
//! those candidates, keyed by peer-id, until a connection is created for
//! that peer; at that point the buffer is drained atomically (spec.md
//! §4.5, §9 "candidates buffered in an ad-hoc map").
//!
//! Invariant (spec.md §3): for any peer-id, at most one of
//! {connection-table entry, ICE buffer entry} exists at a time.

use std::collections::HashMap;

use crate::message::PeerId;
use crate::transport::IceCandidate;

/// Candidates accumulated for a peer we don't yet have a transport for.
#[derive(Debug, Default)]
pub struct PendingSession {
    /// Candidates received so far, in arrival order.
    pub candidates: Vec<IceCandidate>,
}

/// Per-remote buffer of pending candidates.
#[derive(Default)]
pub struct IceBuffer {
    pending: HashMap<PeerId, PendingSession>,
}

impl IceBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `candidate` for `peer`, creating the entry if needed.
    pub fn push(&mut self, peer: &str, candidate: IceCandidate) {
        self.pending
            .entry(peer.to_string())
            .or_default()
            .candidates
            .push(candidate);
    }

    /// True if there are buffered candidates for `peer`.
    pub fn has_pending(&self, peer: &str) -> bool {
        self.pending.contains_key(peer)
    }

    /// Atomically removes and returns every buffered candidate for `peer`.
    /// Called when a Transport Adapter is created for that peer (from
    /// `offer` handling) so the candidates can be applied in order.
    pub fn drain(&mut self, peer: &str) -> Vec<IceCandidate> {
        self.pending
            .remove(peer)
            .map(|s| s.candidates)
            .unwrap_or_default()
    }
}
