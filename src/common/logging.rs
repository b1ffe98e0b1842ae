//! Tracing subscriber setup
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the embedding process. This helper exists for binaries and
//! tests that want a sensible default.

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber filtered by `RUST_LOG`, falling back to
/// the supplied directive (e.g. `"unit_filter=debug"`).
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging("unit_filter=debug");
        // Second call must not panic even though a subscriber is installed
        init_logging("unit_filter=trace");
    }
}
