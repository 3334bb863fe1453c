//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` wins over `default_directive`.
///
/// Returns `false` when a global subscriber was already installed, which
/// happens when an embedding process sets up its own.
pub fn init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .try_init()
        .is_ok()
}
