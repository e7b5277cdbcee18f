//! # Loopback Transport & Rendezvous
//!
//! A self-contained, single-process stand-in for the WebRTC transport and
//! signal-service wiring `meshcast-core` leaves to the embedder. Lets
//! `meshcast-node` start up, adopt an identity, and serve its introspection
//! API without a real browser mesh or signaling backend behind it — useful
//! for demos and integration tests.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use meshcast_core::config;
use meshcast_core::error::TransportError;
use meshcast_core::message::Message;
use meshcast_core::router::TransportFactory;
use meshcast_core::signal::FrameChannel;
use meshcast_core::transport::{ConnectionState, IceCandidate, SessionDescription, Transport};

fn state_from_u8(v: u8) -> ConnectionState {
    match v {
        0 => ConnectionState::Connecting,
        1 => ConnectionState::Open,
        2 => ConnectionState::Closing,
        _ => ConnectionState::Closed,
    }
}

/// An in-memory [`Transport`] that never leaves the process. Answers every
/// handshake call immediately and records sends without delivering them
/// anywhere — enough to let the handshake bring-up and maintenance sweep
/// exercise their code paths end to end with no real peer on the other end.
pub struct LoopbackTransport {
    state: AtomicU8,
    sent: Mutex<Vec<Message>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Messages handed to `send` so far, for tests/diagnostics.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.sent.lock().push(message);
        Ok(())
    }

    async fn create_channel(&self) -> Result<(), TransportError> {
        self.state.store(ConnectionState::Open as u8, Ordering::SeqCst);
        Ok(())
    }

    async fn create_sdp_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok("loopback-offer".to_string())
    }

    async fn create_sdp_answer(
        &self,
        _remote_sdp: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.state.store(ConnectionState::Open as u8, Ordering::SeqCst);
        Ok("loopback-answer".to_string())
    }

    async fn set_remote_description(&self, _sdp: SessionDescription) -> Result<(), TransportError> {
        self.state.store(ConnectionState::Open as u8, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {
        self.state.store(ConnectionState::Closing as u8, Ordering::SeqCst);
        self.state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
    }
}

/// Hands out a fresh [`LoopbackTransport`] for every peer id the router
/// asks for one.
pub struct LoopbackTransportFactory;

impl TransportFactory for LoopbackTransportFactory {
    fn create(&self, _remote_id: &str) -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport::new())
    }
}

/// A [`FrameChannel`] that never leaves the process. On construction it
/// synthesizes a `first-view` frame assigning `self_id` with an empty
/// initial view, mimicking the one round trip a real rendezvous makes
/// before the router can do anything else.
pub struct LoopbackFrameChannel {
    state: AtomicU8,
}

impl LoopbackFrameChannel {
    /// Builds the channel and returns the inbound stream `main` feeds into
    /// [`meshcast_core::Router::handle_message`].
    pub fn new(self_id: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let first_view = Message::new("first-view", config::SIGNAL, "")
            .with_data(json!({ "id": self_id.into(), "view": [] }));
        let _ = tx.send(first_view);
        (Arc::new(Self { state: AtomicU8::new(ConnectionState::Open as u8) }), rx)
    }
}

#[async_trait]
impl FrameChannel for LoopbackFrameChannel {
    fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn send_frame(&self, frame: String) -> Result<(), TransportError> {
        tracing::trace!(%frame, "loopback rendezvous frame sent (discarded)");
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.state.store(ConnectionState::Open as u8, Ordering::SeqCst);
        Ok(())
    }
}
