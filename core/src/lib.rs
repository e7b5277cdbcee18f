// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # meshcast-core — Overlay Mesh Media Distribution Engine
//!
//! The message-routing and media-segment exchange core of a browser-style
//! peer-to-peer video overlay: a mesh of nodes that cooperatively fetch,
//! store, and replay a segmented media file over bidirectional
//! datagram-capable transports, bootstrapped by a central rendezvous
//! service.
//!
//! ## Architecture
//!
//! - **message** — the wire `Message` record and the outbound queue entry.
//! - **emitter** — a typed in-process event bus (subscribe-by-type, dispatch
//!   in registration order, no reentrant interleaving).
//! - **transport** — the `Transport`/`RendezvousChannel`/`Digest`
//!   capabilities the router consumes; real WebRTC/ICE plumbing is the
//!   embedder's problem.
//! - **connection** — the Connection Table: per-peer transport, activity
//!   timestamp, heavy/light weight pair.
//! - **ice** — the pending-candidate arena for sessions whose Transport
//!   doesn't exist yet.
//! - **signal** — the Signal Client, a `RendezvousChannel` over a textual
//!   frame channel with a keepalive heartbeat.
//! - **gossip** — bounded random view maintenance, bandwidth-aware
//!   `max_connections`, and the heavy/light weight protocol's pure decision
//!   function, run on its own cooperative worker task.
//! - **media** — segment index, part/chunk reassembly, the ordered
//!   single-slot append pipeline, and peer selection for missing parts.
//! - **router** — the Peer Core: owns the Connection Table, ICE Buffer,
//!   outbound queue, and Emitter; implements send/broadcast/forward, the
//!   handshake bring-up, the weight protocol's connection-table side, and
//!   periodic maintenance.
//! - **extensions** — the capability traits (`HeavyPolicy`, `GossipControl`)
//!   that let gossip and media opt into router behavior without the router
//!   depending on either.
//! - **util** — deep structural matching, shuffled iteration, mean.
//! - **config** — wire defaults and sentinel constants.
//! - **error** — per-component `thiserror` enums.
//!
//! ## Design Philosophy
//!
//! 1. The router never holds gossip's view mutably — it only caches a
//!    snapshot handed across a channel.
//! 2. Optional behavior (heavy admission, gossip) is feature-tested through
//!    small traits, never assumed present.
//! 3. A part's status only ever moves forward: `needed → pending →
//!    available → added`.
//! 4. Content-digest mismatches are logged, not fatal; structural
//!    violations (an unexpected append, an invalid message) are surfaced.

pub mod config;
pub mod connection;
pub mod emitter;
pub mod error;
pub mod extensions;
pub mod gossip;
pub mod ice;
pub mod media;
pub mod message;
pub mod router;
pub mod signal;
pub mod transport;
pub mod util;

pub use connection::{Connection, ConnectionTable, Weight, WeightPair};
pub use emitter::Emitter;
pub use error::{MediaError, RouterError, TransportError};
pub use extensions::{Extensions, GossipControl, HeavyPolicy};
pub use gossip::{GossipConfig, GossipEngine, GossipHandle};
pub use ice::IceBuffer;
pub use media::{MediaManager, PartAddr, SegmentIndex};
pub use message::{Message, PeerId, QueuedMessage};
pub use router::{Router, TransportFactory};
pub use signal::SignalClient;
pub use transport::{ConnectionState, Digest, RendezvousChannel, Sha256Digest, Transport};
