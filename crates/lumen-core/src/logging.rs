//! Logging initialization for lumen.
//!
//! The level is controlled by `RUST_LOG` when set; otherwise the level passed
//! by the caller (or `info`) applies:
//!
//! ```bash
//! # Per-connection accept/close traces
//! RUST_LOG=lumen_core=debug lumen -p 9006
//!
//! # Only warnings and errors
//! RUST_LOG=warn lumen
//! ```
//!
//! Disabling logging entirely (`lumen -c 1`) simply skips initialization, so
//! every `tracing` call site becomes a no-op.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize human-readable logging at `info`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Call it once at
/// startup.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize human-readable logging with a specific default level.
///
/// `RUST_LOG` still wins when present.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Initialize JSON-formatted logging, one object per line.
pub fn init_logging_json(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
