//! Tracing/logging initialization.
//!
//! Worker and reaper loops log claim/heartbeat/finalize activity at debug
//! level; the default filter keeps that quiet unless RUST_LOG opts in.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_default("info");
}

/// Initialize with an explicit default directive, still overridable via
/// RUST_LOG (e.g. `RUST_LOG=pressforge_queue=debug`).
pub fn init_with_default(directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive));

    // JSON logs + timestamps; worker fleets ship these to the log pipeline.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
