//! Tracing subscriber setup for the binaries and tests.
//!
//! The library only emits events; installing a subscriber is up to the host.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `evloop=info`).
/// A second call is a no-op.
pub fn init() {
    init_with_default("evloop=info");
}

pub fn init_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false),
        )
        .with(filter)
        .try_init();
}
