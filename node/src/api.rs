//! # REST + WebSocket API
//!
//! Builds the axum router that exposes the overlay node's introspection
//! interface. All endpoints share application state through axum's `State`
//! extractor.
//!
//! ## Endpoints
//!
//! | Method | Path            | Description                              |
//! |--------|-----------------|-------------------------------------------|
//! | GET    | `/health`       | Liveness probe                            |
//! | GET    | `/status`       | Node/gossip/media status summary          |
//! | GET    | `/peers`        | Current gossip view (last snapshot)       |
//! | GET    | `/media`        | Media manager part progress               |
//! | GET    | `/ws`           | WebSocket for live peer/media events       |

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router as AxumRouter,
};
use meshcast_core::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone — everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    /// The rendezvous URL this node bootstrapped against, for display only.
    pub rendezvous_url: String,
    /// The Peer Core. Source of truth for id, queue length, and connection
    /// counts.
    pub router: Arc<Router>,
    /// Media manager, for part-progress reporting.
    pub media: Arc<parking_lot::Mutex<meshcast_core::media::MediaManager>>,
    /// Gossip handle, for view size / heavy admission cap reporting.
    pub gossip: Arc<meshcast_core::GossipHandle>,
    /// Broadcast channel for live event notifications (peers, parts).
    pub event_tx: broadcast::Sender<NodeEvent>,
    /// Reference to Prometheus metrics for in-handler recording.
    pub metrics: SharedMetrics,
}

/// Events pushed to WebSocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeEvent {
    /// A connection reached the `Open` state.
    #[serde(rename = "peer_connected")]
    PeerConnected { peer_id: String },
    /// A connection was torn down or purged as idle.
    #[serde(rename = "peer_disconnected")]
    PeerDisconnected { peer_id: String },
    /// A media part reached `Added`.
    #[serde(rename = "part_added")]
    PartAdded { part: u32 },
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`AxumRouter`] with all API routes, CORS, and tracing.
///
/// The returned router is ready to be served on the configured API port.
pub fn create_router(state: AppState) -> AxumRouter {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    AxumRouter::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/peers", get(peers_handler))
        .route("/media", get(media_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Node software version.
    pub version: String,
    /// This node's id, empty until adopted from `first-view`.
    pub node_id: String,
    /// Rendezvous URL this node bootstrapped against.
    pub rendezvous_url: String,
    /// Total entries in the Connection Table.
    pub connection_count: usize,
    /// Connections currently in the `Open` state.
    pub open_connection_count: usize,
    /// Size of the current gossip view.
    pub gossip_view_size: usize,
    /// Current heavy-connection admission cap.
    pub heavy_connection_cap: usize,
    /// Current outbound queue length.
    pub queue_length: usize,
    /// Whether metadata has been set and every known part has been added.
    pub media_complete: bool,
}

/// Response payload for `GET /peers`.
#[derive(Debug, Serialize)]
pub struct PeersResponse {
    pub peers: Vec<meshcast_core::gossip::NodeDescriptor>,
}

/// Response payload for `GET /media`.
#[derive(Debug, Serialize)]
pub struct MediaResponse {
    /// Total number of known parts, 0 if metadata hasn't been set yet.
    pub part_count: usize,
    /// Number of parts that have reached `Added`.
    pub added_count: usize,
    /// True once every known part has reached `Added`.
    pub complete: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — returns 200 if the node is alive.
///
/// This is the liveness probe for orchestrators (k8s, systemd, etc.).
/// It intentionally does not check internal subsystem health — that
/// belongs in `/status`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status` — returns node status summary.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let media = state.media.lock();
    let resp = StatusResponse {
        version: state.version.clone(),
        node_id: state.router.id(),
        rendezvous_url: state.rendezvous_url.clone(),
        connection_count: state.router.connection_count(),
        open_connection_count: state.router.open_connection_count(),
        gossip_view_size: state.gossip.view_size(),
        heavy_connection_cap: state.gossip.max_connections(),
        queue_length: state.router.queue_len(),
        media_complete: media.all_parts_added(),
    };
    Json(resp)
}

/// `GET /peers` — returns the most recent gossip view snapshot.
async fn peers_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(PeersResponse {
        peers: state.router.last_view(),
    })
}

/// `GET /media` — returns part download/append progress.
async fn media_handler(State(state): State<AppState>) -> impl IntoResponse {
    let media = state.media.lock();
    Json(MediaResponse {
        part_count: media.part_count(),
        added_count: media.added_count(),
        complete: media.all_parts_added(),
    })
}

/// `GET /ws` — WebSocket upgrade for live event streaming.
///
/// Clients receive JSON-encoded [`NodeEvent`] messages for peer and media
/// changes. The connection is read-only from the server's perspective;
/// client messages are ignored.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Drives a single WebSocket connection, forwarding broadcast events
/// until the client disconnects or the channel is closed.
async fn handle_ws_connection(mut socket: WebSocket, state: AppState) {
    let mut rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        let payload = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!("failed to serialize ws event: {}", e);
                                continue;
                            }
                        };
                        if socket.send(WsMessage::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ws subscriber lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => {
                        // Client messages are ignored — this is a push-only channel.
                    }
                    _ => break, // Disconnected or error.
                }
            }
        }
    }
}
