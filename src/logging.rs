//! Tracing initialization for embedding shells.
//!
//! The core itself only emits `tracing` events; a shell that has no
//! subscriber of its own can call [`init`] once at startup.

use tracing::level_filters::LevelFilter;

/// Install a console subscriber honoring `RUST_LOG`-style levels.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(resolve_level())
        .try_init();
}

fn resolve_level() -> LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(val) => match val.to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            _ => LevelFilter::INFO,
        },
        Err(_) => LevelFilter::INFO,
    }
}
