//! # Connection Table
//!
//! Map from peer-id to [`Transport`], plus the bookkeeping the router and
//! gossip engine need on top of raw transport state: a monotonic
//! `last_activity` timestamp and the heavy/light weight pair used by the
//! bulk-media admission protocol (spec.md §3, §4.6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::message::PeerId;
use crate::transport::{ConnectionState, Transport};

/// Bulk-media admission weight for one direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weight {
    /// Only small/control traffic is expected on this direction.
    Light,
    /// This direction is cleared to carry bulk media transfers.
    Heavy,
}

impl Default for Weight {
    fn default() -> Self {
        Weight::Light
    }
}

/// Per-direction weight pair for a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightPair {
    /// Weight of traffic flowing into us from the remote.
    pub incoming: Weight,
    /// Weight of traffic we are cleared to send to the remote.
    pub outgoing: Weight,
}

/// A single entry in the Connection Table.
pub struct Connection {
    /// The remote peer-id, or [`crate::config::SIGNAL`] for the rendezvous.
    pub remote_id: PeerId,
    /// The underlying transport.
    pub transport: Arc<dyn Transport>,
    /// Last time this connection carried traffic (send or receive).
    pub last_activity: Instant,
    /// Current heavy/light weight in each direction.
    pub weight: WeightPair,
}

impl Connection {
    /// Wraps a freshly created transport as a connecting entry.
    pub fn new(remote_id: PeerId, transport: Arc<dyn Transport>) -> Self {
        Self {
            remote_id,
            transport,
            last_activity: Instant::now(),
            weight: WeightPair::default(),
        }
    }

    /// Current transport state.
    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Marks this connection as having just carried traffic.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// True if idle longer than `threshold`.
    pub fn idle_for(&self, threshold: std::time::Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > threshold
    }
}

/// Map from peer-id (or [`crate::config::SIGNAL`]) to [`Connection`].
#[derive(Default)]
pub struct ConnectionTable {
    connections: HashMap<PeerId, Connection>,
}

impl ConnectionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the connection for `remote_id`.
    pub fn insert(&mut self, conn: Connection) {
        self.connections.insert(conn.remote_id.clone(), conn);
    }

    /// Looks up a connection by remote id.
    pub fn get(&self, remote_id: &str) -> Option<&Connection> {
        self.connections.get(remote_id)
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, remote_id: &str) -> Option<&mut Connection> {
        self.connections.get_mut(remote_id)
    }

    /// Removes and returns the connection for `remote_id`, if any.
    pub fn remove(&mut self, remote_id: &str) -> Option<Connection> {
        self.connections.remove(remote_id)
    }

    /// True if there is an entry (of any state) for `remote_id`.
    pub fn contains(&self, remote_id: &str) -> bool {
        self.connections.contains_key(remote_id)
    }

    /// True if there is an *open* connection to `remote_id`.
    pub fn is_open_neighbor(&self, remote_id: &str) -> bool {
        self.connections
            .get(remote_id)
            .is_some_and(|c| c.state().is_open())
    }

    /// Iterates all connections other than the rendezvous.
    pub fn peers(&self) -> impl Iterator<Item = &Connection> {
        self.connections
            .values()
            .filter(|c| c.remote_id != crate::config::SIGNAL)
    }

    /// Iterates every open connection other than the rendezvous.
    pub fn open_peers(&self) -> impl Iterator<Item = &Connection> {
        self.peers().filter(|c| c.state().is_open())
    }

    /// Count of connections whose incoming weight is currently `Heavy`.
    pub fn heavy_incoming_count(&self) -> usize {
        self.peers()
            .filter(|c| matches!(c.weight.incoming, Weight::Heavy))
            .count()
    }

    /// Removes every connection currently in `Closed` state (§3 invariant:
    /// closed connections are purged at the next maintenance tick).
    pub fn purge_closed(&mut self) {
        self.connections
            .retain(|_, c| !matches!(c.state(), ConnectionState::Closed));
    }

    /// All remote-ids whose connection is open and idle past `threshold`,
    /// excluding the rendezvous (which is never auto-closed for inactivity).
    pub fn idle_peers(&self, threshold: std::time::Duration, now: Instant) -> Vec<PeerId> {
        self.peers()
            .filter(|c| c.state().is_open() && c.idle_for(threshold, now))
            .map(|c| c.remote_id.clone())
            .collect()
    }

    /// Number of entries, including the rendezvous if present.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
