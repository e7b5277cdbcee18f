//! # Prometheus Metrics
//!
//! Exposes operational metrics for the overlay node. Scraped by Prometheus
//! at the `/metrics` HTTP endpoint on the configured metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use meshcast_core::extensions::RoutingObserver;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (wraps `Arc` internally via prometheus handles) so it can
/// be shared across request handlers and background tasks.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Number of currently open overlay connections.
    pub connected_peers: IntGauge,
    /// Size of the current gossip view.
    pub gossip_view_size: IntGauge,
    /// Current heavy-connection admission cap (bandwidth-derived).
    pub heavy_connection_cap: IntGauge,
    /// Current length of the Peer Core's outbound queue.
    pub queue_length: IntGauge,
    /// Total messages routed via `Router::send`.
    pub messages_routed_total: IntCounter,
    /// Total messages that fell back to sender-excluded broadcast.
    pub messages_broadcast_total: IntCounter,
    /// Total media parts that reached `added` status.
    pub parts_added_total: IntCounter,
    /// Total content-digest mismatches observed (non-fatal, logged).
    pub digest_mismatches_total: IntCounter,
    /// Histogram of time between a part being marked pending and added.
    pub part_append_latency_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("meshcast".into()), None)
            .expect("failed to create prometheus registry");

        let connected_peers =
            IntGauge::new("connected_peers", "Number of currently open overlay connections")
                .expect("metric creation");
        registry
            .register(Box::new(connected_peers.clone()))
            .expect("metric registration");

        let gossip_view_size = IntGauge::new("gossip_view_size", "Size of the current gossip view")
            .expect("metric creation");
        registry
            .register(Box::new(gossip_view_size.clone()))
            .expect("metric registration");

        let heavy_connection_cap = IntGauge::new(
            "heavy_connection_cap",
            "Current heavy-connection admission cap",
        )
        .expect("metric creation");
        registry
            .register(Box::new(heavy_connection_cap.clone()))
            .expect("metric registration");

        let queue_length = IntGauge::new("queue_length", "Current length of the outbound queue")
            .expect("metric creation");
        registry
            .register(Box::new(queue_length.clone()))
            .expect("metric registration");

        let messages_routed_total = IntCounter::new(
            "messages_routed_total",
            "Total number of messages routed via send()",
        )
        .expect("metric creation");
        registry
            .register(Box::new(messages_routed_total.clone()))
            .expect("metric registration");

        let messages_broadcast_total = IntCounter::new(
            "messages_broadcast_total",
            "Total number of messages that fell back to sender-excluded broadcast",
        )
        .expect("metric creation");
        registry
            .register(Box::new(messages_broadcast_total.clone()))
            .expect("metric registration");

        let parts_added_total = IntCounter::new(
            "parts_added_total",
            "Total media parts that reached added status",
        )
        .expect("metric creation");
        registry
            .register(Box::new(parts_added_total.clone()))
            .expect("metric registration");

        let digest_mismatches_total = IntCounter::new(
            "digest_mismatches_total",
            "Total content-digest mismatches observed",
        )
        .expect("metric creation");
        registry
            .register(Box::new(digest_mismatches_total.clone()))
            .expect("metric registration");

        let part_append_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "part_append_latency_seconds",
                "Time between a part being marked pending and reaching added",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .expect("metric creation");
        registry
            .register(Box::new(part_append_latency_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            connected_peers,
            gossip_view_size,
            heavy_connection_cap,
            queue_length,
            messages_routed_total,
            messages_broadcast_total,
            parts_added_total,
            digest_mismatches_total,
            part_append_latency_seconds,
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingObserver for NodeMetrics {
    fn message_routed(&self) {
        self.messages_routed_total.inc();
    }

    fn message_broadcast(&self) {
        self.messages_broadcast_total.inc();
    }
}

/// Shared metrics state passed to axum handlers via extension.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
///
/// Returns HTTP 500 if encoding fails (should never happen in practice).
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
