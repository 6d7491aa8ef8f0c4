//! Process-wide logging setup, built on `tracing`.
//!
//! Mirrors the convention used across this lineage: a binary calls
//! [`setup_logging`] exactly once before touching the network, and every
//! module below logs through the re-exported `info!`/`warn!`/`error!`/`debug!`
//! macros rather than `println!`.

use std::sync::Once;

pub use tracing::{debug, error, info, trace, warn};

static INIT: Once = Once::new();

/// What kind of process is logging; folded into the default target filter so
/// a bootstrap child and the launching parent don't have to agree on one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    /// The long-running RPC server / client process.
    Runtime,
    /// The bootstrap entry point for a freshly spawned child.
    Bootstrap,
}

/// Installs the global `tracing` subscriber. Safe to call more than once;
/// only the first call takes effect.
pub fn setup_logging(level: &str, kind: LogType) {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_new(level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_ansi(true)
            .init();
        let _ = tracing_log::LogTracer::init();
        info!(?kind, "logging initialized");
    });
}
