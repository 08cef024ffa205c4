//! Logging
//!
//! Installs the global `tracing` subscriber for the Hermes binaries.
//! `RUST_LOG` wins over the level passed in; output goes to stderr so
//! command output on stdout stays machine-readable.

use std::io;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Level used when `RUST_LOG` is unset: `info`, or `debug` when verbose.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// Sets up the subscriber. Calling it twice is harmless; the second call
/// leaves the first subscriber in place.
pub fn init(verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init();
}
