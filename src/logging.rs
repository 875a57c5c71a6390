//! Optional `tracing` subscriber for embedding programs and tests.
//!
//! The engine itself only emits events: a span per executed task, `debug`
//! for refcount transitions and closings, `warn` for placements that cannot
//! be satisfied, `error` for failed tasks.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a compact stderr subscriber filtered by `RUST_LOG`, defaulting to
/// `warn`.
///
/// ```bash
/// RUST_LOG=sluice=debug cargo test
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // A second call (e.g. from another test) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
