//! Tracing subscriber setup for launchers.
//!
//! Library code only emits `tracing` events; installing a subscriber is left to
//! the binary (or test) that embeds the runner.

use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INIT_GUARD: OnceLock<Result<(), String>> = OnceLock::new();

/// Install the global `fmt` subscriber (idempotent).
///
/// The filter comes from `RUST_LOG`, falling back to `info`.
pub fn init_tracing() {
    let result = INIT_GUARD.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        Registry::default()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|err| err.to_string())
    });

    if let Err(err) = result {
        tracing::warn!("failed to initialise tracing subscriber: {err}");
    }
}
