//! Tracing setup for binaries and tests.
//!
//! The library only emits `tracing` events; it never installs a subscriber
//! on its own. Call [`init_tracing`] from a test or an embedding binary to
//! see them.

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Install a fmt subscriber filtered by `RUST_LOG`.
///
/// Does nothing when `RUST_LOG` is unset or a global subscriber already
/// exists. Safe to call many times.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        if std::env::var("RUST_LOG").is_ok() {
            let filter = EnvFilter::from_default_env();
            let _ = tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(filter)
                .try_init();
        }
    });
}
