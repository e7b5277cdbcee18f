// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # meshcast Overlay Node
//!
//! Entry point for the `meshcast-node` binary: a standalone embedding
//! harness for `meshcast-core`. Wires a Peer Core, Gossip Engine, and Media
//! Manager over a loopback transport (no real WebRTC/ICE — that's the
//! embedder's problem, per `meshcast-core`'s design), serves an
//! introspection API, and exposes Prometheus metrics.
//!
//! The binary supports three subcommands:
//!
//! - `run`     — start the overlay node
//! - `status`  — query a running node's introspection endpoint
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod loopback;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::signal;
use tokio::sync::broadcast;

use async_trait::async_trait;
use meshcast_core::error::TransportError;
use meshcast_core::extensions::Extensions;
use meshcast_core::gossip::{self, GossipConfig};
use meshcast_core::media::{MediaEvent, MediaManager, PlaybackSink};
use meshcast_core::signal::SignalClient;
use meshcast_core::transport::{RendezvousChannel, Sha256Digest};
use meshcast_core::Router;

use api::NodeEvent;
use cli::{Commands, MeshcastNodeCli};
use logging::LogFormat;
use loopback::{LoopbackFrameChannel, LoopbackTransportFactory};
use metrics::NodeMetrics;

/// Broadcast channel capacity for live event streaming.
/// 256 is large enough to absorb short bursts without dropping events
/// for connected WebSocket clients.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Interval between `Router::run_maintenance` sweeps — matches the queue
/// timeout, since that's the shortest deadline maintenance has to catch.
const MAINTENANCE_INTERVAL: std::time::Duration = meshcast_core::config::QUEUE_TIMEOUT;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = MeshcastNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run — Full node startup sequence
// ---------------------------------------------------------------------------

/// A [`PlaybackSink`] that just logs appends. Standing in for a real
/// container demuxer/decoder, which is out of scope for `meshcast-core`.
struct LoggingPlaybackSink;

#[async_trait]
impl PlaybackSink for LoggingPlaybackSink {
    async fn open(&self, codec: &str) -> Result<(), TransportError> {
        tracing::info!(codec, "playback sink opened");
        Ok(())
    }

    async fn append(&self, bytes: bytes::Bytes) -> Result<(), TransportError> {
        tracing::debug!(len = bytes.len(), "appended buffer to playback sink");
        Ok(())
    }

    async fn end_of_stream(&self) {
        tracing::info!("playback sink reached end of stream");
    }
}

/// Generates a process-unique node id for the standalone loopback
/// rendezvous to assign. A real deployment's rendezvous would assign this
/// instead (spec.md's `first-view` handshake).
fn generate_node_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("node-{}-{:x}", std::process::id(), nanos)
}

/// Starts the full overlay node: introspection API, metrics endpoint, and
/// the Peer Core / Gossip Engine / Media Manager wired over a loopback
/// transport.
///
/// Startup sequence:
/// 1. Initialize logging
/// 2. Generate this node's provisional id
/// 3. Build the loopback rendezvous channel and transport factory
/// 4. Spawn the gossip worker, build Extensions from its handle
/// 5. Build the Router and wire the gossip event loop
/// 6. Feed the rendezvous channel's inbound frames into the router
/// 7. Build the Media Manager
/// 8. Spawn the periodic maintenance ticker
/// 9. Serve the introspection API and metrics endpoint
/// 10. Await shutdown
async fn run_node(args: cli::RunArgs) -> Result<()> {
    let log_format = LogFormat::from_str_lossy(&args.log_format);
    let log_filter = format!(
        "meshcast_node={level},meshcast_core={level},tower_http=info",
        level = args.log_level
    );
    logging::init_logging(&log_filter, log_format);

    tracing::info!(
        api_addr = %args.api_addr,
        metrics_addr = %args.metrics_addr,
        rendezvous_url = %args.rendezvous_url,
        "starting meshcast-node"
    );

    let self_id = generate_node_id();

    let (frame_channel, mut inbound_frames) = LoopbackFrameChannel::new(self_id.clone());
    let signal_client = Arc::new(SignalClient::new(frame_channel));
    signal_client.set_self_id(self_id.clone());
    let mut keepalive_frames = signal_client.spawn_keepalive();
    let rendezvous: Arc<dyn RendezvousChannel> = signal_client;

    let (gossip_handle, gossip_events) = gossip::spawn(self_id.clone(), GossipConfig::default());
    let gossip_handle = Arc::new(gossip_handle);

    let node_metrics = Arc::new(NodeMetrics::new());

    let extensions = Extensions::none()
        .with_heavy_policy(Arc::new(meshcast_core::media::MediaHeavyPolicy::new(
            gossip_handle.clone(),
        )))
        .with_gossip(gossip_handle.clone())
        .with_routing_observer(node_metrics.clone());

    let router = Arc::new(Router::new(
        rendezvous,
        Arc::new(LoopbackTransportFactory),
        extensions,
    ));
    router.spawn_gossip_event_loop(gossip_events);

    let router_for_inbound = router.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = inbound_frames.recv() => {
                    match message {
                        Some(message) => router_for_inbound.handle_message(message).await,
                        None => break,
                    }
                }
                message = keepalive_frames.recv() => {
                    match message {
                        Some(message) => router_for_inbound.handle_message(message).await,
                        None => {}
                    }
                }
            }
        }
    });

    let (media_manager, mut media_events) =
        MediaManager::new(Arc::new(LoggingPlaybackSink), Arc::new(Sha256Digest));
    let media = Arc::new(parking_lot::Mutex::new(media_manager));

    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let media_event_metrics = node_metrics.clone();
    let media_event_tx = event_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = media_events.recv().await {
            match event {
                MediaEvent::PartAdded { part, latency } => {
                    media_event_metrics.parts_added_total.inc();
                    media_event_metrics.part_append_latency_seconds.observe(latency.as_secs_f64());
                    let _ = media_event_tx.send(NodeEvent::PartAdded { part });
                }
                MediaEvent::DigestMismatch(err) => {
                    media_event_metrics.digest_mismatches_total.inc();
                    tracing::warn!(error = %err, "media part failed digest verification");
                }
                MediaEvent::StreamEnded => {
                    tracing::info!("media stream reached end of stream");
                }
            }
        }
    });

    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        rendezvous_url: args.rendezvous_url.clone(),
        router: router.clone(),
        media: media.clone(),
        gossip: gossip_handle.clone(),
        event_tx: event_tx.clone(),
        metrics: node_metrics.clone(),
    };

    let maintenance_router = router.clone();
    let maintenance_gossip = gossip_handle.clone();
    let maintenance_metrics = node_metrics.clone();
    let maintenance_event_tx = event_tx.clone();
    let maintenance_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        let mut known_peers: HashSet<String> = HashSet::new();
        loop {
            ticker.tick().await;
            maintenance_router.run_maintenance().await;

            maintenance_metrics
                .connected_peers
                .set(maintenance_router.open_connection_count() as i64);
            maintenance_metrics
                .queue_length
                .set(maintenance_router.queue_len() as i64);
            maintenance_metrics
                .gossip_view_size
                .set(maintenance_gossip.view_size() as i64);
            maintenance_metrics
                .heavy_connection_cap
                .set(maintenance_gossip.max_connections() as i64);

            let current_peers: HashSet<String> = maintenance_router.open_peer_ids().into_iter().collect();
            for peer_id in current_peers.difference(&known_peers) {
                let _ = maintenance_event_tx.send(NodeEvent::PeerConnected { peer_id: peer_id.clone() });
            }
            for peer_id in known_peers.difference(&current_peers) {
                let _ = maintenance_event_tx.send(NodeEvent::PeerDisconnected { peer_id: peer_id.clone() });
            }
            known_peers = current_peers;
        }
    });

    let api_router = api::create_router(app_state);
    let api_listener = tokio::net::TcpListener::bind(&args.api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", args.api_addr))?;
    tracing::info!("introspection API listening on {}", args.api_addr);

    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(node_metrics.clone());
    let metrics_listener = tokio::net::TcpListener::bind(&args.metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", args.metrics_addr))?;
    tracing::info!("metrics server listening on {}", args.metrics_addr);

    print_startup_banner(&self_id, &args.api_addr, &args.metrics_addr, &args.rendezvous_url);

    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    maintenance_handle.abort();
    tracing::info!("meshcast-node stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// status — Query a running node
// ---------------------------------------------------------------------------

/// Queries a running node's `/status` endpoint and prints the result.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.api_url.trim_end_matches('/'));
    let body = http_get(&url).await?;

    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => {
            if let Some(version) = json.get("version").and_then(|v| v.as_str()) {
                println!("Node Status");
                println!("  Version             : {}", version);
            }
            if let Some(id) = json.get("node_id").and_then(|v| v.as_str()) {
                println!("  Node ID             : {}", id);
            }
            if let Some(n) = json.get("connection_count").and_then(|v| v.as_u64()) {
                println!("  Connections         : {}", n);
            }
            if let Some(n) = json.get("open_connection_count").and_then(|v| v.as_u64()) {
                println!("  Open connections    : {}", n);
            }
            if let Some(n) = json.get("gossip_view_size").and_then(|v| v.as_u64()) {
                println!("  Gossip view size    : {}", n);
            }
            if let Some(n) = json.get("heavy_connection_cap").and_then(|v| v.as_u64()) {
                println!("  Heavy connection cap: {}", n);
            }
            if let Some(n) = json.get("queue_length").and_then(|v| v.as_u64()) {
                println!("  Queue length        : {}", n);
            }
            if let Some(complete) = json.get("media_complete").and_then(|v| v.as_bool()) {
                println!("  Media complete      : {}", if complete { "yes" } else { "no" });
            }
        }
        Err(_) => {
            println!("{}", body);
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// version
// ---------------------------------------------------------------------------

/// Prints version information to stdout.
fn print_version() {
    println!("meshcast-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc         {}", rustc_version());
    if let Some(commit) = option_env!("GIT_COMMIT") {
        println!("commit        {}", commit);
    }
    if let Some(ts) = option_env!("BUILD_TIMESTAMP") {
        println!("built         {}", ts);
    }
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

// ---------------------------------------------------------------------------
// Startup banner
// ---------------------------------------------------------------------------

/// Prints the node startup banner with configuration summary.
fn print_startup_banner(node_id: &str, api_addr: &str, metrics_addr: &str, rendezvous_url: &str) {
    let node_id_short = if node_id.len() > 28 {
        format!("{}...", &node_id[..28])
    } else {
        node_id.to_string()
    };

    let lines = [
        format!("  Node ID:     {}", node_id_short),
        format!("  API:         http://{}", api_addr),
        format!("  Metrics:     http://{}/metrics", metrics_addr),
        format!("  Rendezvous:  {}", rendezvous_url),
    ];

    let title = format!("  meshcast Overlay Node v{}", env!("CARGO_PKG_VERSION"));

    let max_width = lines
        .iter()
        .map(|l| l.len())
        .chain(std::iter::once(title.len()))
        .max()
        .unwrap_or(50)
        + 4;

    let border = "\u{2550}".repeat(max_width);

    println!();
    println!("\u{2554}{}\u{2557}", border);
    println!("\u{2551}  {:<width$}  \u{2551}", title.trim(), width = max_width - 4);
    println!("\u{2560}{}\u{2563}", border);
    for line in &lines {
        println!("\u{2551}  {:<width$}  \u{2551}", line.trim(), width = max_width - 4);
    }
    println!("\u{255A}{}\u{255D}", border);
    println!();
}

// ---------------------------------------------------------------------------
// Shutdown signal
// ---------------------------------------------------------------------------

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Fetches `url` and returns the response body as text.
async fn http_get(url: &str) -> Result<String> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("failed to reach {}", url))?
        .error_for_status()
        .with_context(|| format!("{} returned an error status", url))?;
    response.text().await.context("failed to read response body")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_unique_across_calls() {
        let a = generate_node_id();
        let b = generate_node_id();
        assert_ne!(a, b);
        assert!(a.starts_with("node-"));
    }

    #[test]
    fn startup_banner_does_not_panic() {
        print_startup_banner(
            "node-1234-abcdef0123456789",
            "127.0.0.1:7741",
            "127.0.0.1:7742",
            "loopback://local",
        );
    }
}
