//! # Signal Client
//!
//! Implements [`RendezvousChannel`] over a persistent bidirectional textual
//! frame channel toward the rendezvous service (spec.md §4.4). Forces
//! `ttl = 0` on every outgoing frame, derives `state()` from the underlying
//! channel, and emits a `signal:keepalive` self-message on a fixed interval
//! so endpoints that idle out around 30s don't drop the connection.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config;
use crate::error::TransportError;
use crate::message::{Message, PeerId};
use crate::transport::{ConnectionState, RendezvousChannel};

/// The raw bidirectional text-frame channel a [`SignalClient`] wraps.
/// Implemented by the embedder (WebSocket, QUIC stream, in-memory
/// loopback, …) — this is the one piece of the rendezvous wire protocol
/// the core actually depends on (spec.md §6's framing note).
#[async_trait]
pub trait FrameChannel: Send + Sync {
    fn state(&self) -> ConnectionState;
    async fn send_frame(&self, frame: String) -> Result<(), TransportError>;
    async fn reconnect(&self) -> Result<(), TransportError>;
}

/// The Signal Client: a `RendezvousChannel` over a [`FrameChannel`], plus
/// the keepalive heartbeat.
pub struct SignalClient {
    channel: Arc<dyn FrameChannel>,
    self_id: Mutex<PeerId>,
}

impl SignalClient {
    pub fn new(channel: Arc<dyn FrameChannel>) -> Self {
        Self {
            channel,
            self_id: Mutex::new(String::new()),
        }
    }

    /// Spawns the periodic `signal:keepalive` heartbeat. The returned
    /// sender lets the caller feed the resulting frames wherever inbound
    /// frames from this channel are otherwise dispatched (the keepalive is
    /// a self-message, not a wire read, per spec.md §4.4).
    pub fn spawn_keepalive(self: &Arc<Self>) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config::SIGNAL_KEEPALIVE_INTERVAL);
            loop {
                ticker.tick().await;
                let self_id = client.self_id.lock().clone();
                let keepalive = Message::new("signal:keepalive", self_id, config::SIGNAL);
                trace!("emitting signal:keepalive");
                if tx.send(keepalive).is_err() {
                    debug!("keepalive receiver dropped, stopping heartbeat");
                    break;
                }
            }
        });
        rx
    }

    /// Records this node's id once adopted from `first-view`, so the
    /// keepalive heartbeat's `from` field is accurate.
    pub fn set_self_id(&self, id: impl Into<PeerId>) {
        *self.self_id.lock() = id.into();
    }
}

#[async_trait]
impl RendezvousChannel for SignalClient {
    fn state(&self) -> ConnectionState {
        self.channel.state()
    }

    async fn send(&self, mut message: Message) -> Result<(), TransportError> {
        message.ttl = 0;
        let frame = serde_json::to_string(&message)
            .map_err(|e| TransportError::SdpFailed(format!("frame encoding failed: {e}")))?;
        self.channel.send_frame(frame).await
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.channel.reconnect().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU8, Ordering};

    use super::*;

    struct FakeFrameChannel {
        state: AtomicU8,
        sent: Mutex<Vec<String>>,
    }

    impl FakeFrameChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                state: AtomicU8::new(ConnectionState::Open as u8),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl FrameChannel for FakeFrameChannel {
        fn state(&self) -> ConnectionState {
            match self.state.load(Ordering::SeqCst) {
                0 => ConnectionState::Connecting,
                1 => ConnectionState::Open,
                2 => ConnectionState::Closing,
                _ => ConnectionState::Closed,
            }
        }
        async fn send_frame(&self, frame: String) -> Result<(), TransportError> {
            self.sent.lock().push(frame);
            Ok(())
        }
        async fn reconnect(&self) -> Result<(), TransportError> {
            self.state.store(ConnectionState::Connecting as u8, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn outgoing_ttl_is_forced_to_zero() {
        let channel = FakeFrameChannel::new();
        let client = SignalClient::new(channel.clone());

        let msg = Message::new("request-peer", "a", config::SIGNAL).with_ttl(3);
        client.send(msg).await.unwrap();

        let sent = channel.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("\"ttl\":0"));
    }

    #[tokio::test]
    async fn state_mirrors_underlying_channel() {
        let channel = FakeFrameChannel::new();
        let client = SignalClient::new(channel.clone());
        assert_eq!(client.state(), ConnectionState::Open);
    }
}
