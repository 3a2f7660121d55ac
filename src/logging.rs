//! Tracing subscriber bootstrap for binaries and integration harnesses.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a formatted subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (e.g. `"anchor_jobs=info"`).
///
/// Returns `false` when a global subscriber was already installed; calling
/// it more than once is harmless.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
