//! # CLI Interface
//!
//! Defines the command-line argument structure for `meshcast-node` using
//! `clap` derive. Supports three subcommands: `run`, `status`, and
//! `version`.

use clap::{Parser, Subcommand};

/// meshcast overlay node.
///
/// A standalone embedding harness for `meshcast-core`: wires a Peer Core,
/// Gossip Engine, and Media Manager over a loopback transport, serves an
/// introspection API, and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "meshcast-node",
    about = "meshcast overlay node",
    version,
    propagate_version = true
)]
pub struct MeshcastNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the meshcast node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the overlay node.
    Run(RunArgs),
    /// Query the status of a running node via its introspection API.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Address for the introspection API (health/status/peers/media).
    #[arg(long, env = "MESHCAST_API_ADDR", default_value = "127.0.0.1:7741")]
    pub api_addr: String,

    /// Address for the Prometheus metrics endpoint.
    #[arg(long, env = "MESHCAST_METRICS_ADDR", default_value = "127.0.0.1:7742")]
    pub metrics_addr: String,

    /// URL of the rendezvous service this node bootstraps against.
    ///
    /// The bundled harness only ships a loopback rendezvous for
    /// standalone demos — a real deployment would point this at a live
    /// signaling endpoint and swap in a `FrameChannel` that speaks to it.
    #[arg(long, env = "MESHCAST_RENDEZVOUS_URL", default_value = "loopback://local")]
    pub rendezvous_url: String,

    /// Log verbosity: error, warn, info, debug, or trace.
    #[arg(long, env = "MESHCAST_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: pretty or json.
    #[arg(long, env = "MESHCAST_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `status` subcommand.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Introspection API endpoint of the running node.
    #[arg(long, default_value = "http://127.0.0.1:7741")]
    pub api_url: String,
}

/// Returns true if `level` is one of the `tracing`-recognized severity
/// names.
pub fn validate_log_level(level: &str) -> bool {
    matches!(level, "error" | "warn" | "info" | "debug" | "trace")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        MeshcastNodeCli::command().debug_assert();
    }

    #[test]
    fn log_level_validation() {
        assert!(validate_log_level("info"));
        assert!(validate_log_level("trace"));
        assert!(!validate_log_level("garbage"));
    }
}
