//! Tracing subscriber setup for the `daq-relay` binary and embedding
//! applications.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber. `RUST_LOG` overrides the configured
/// level. Returns `false` when a subscriber was already installed, in which
/// case the existing one is kept.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.is_ok()
}
