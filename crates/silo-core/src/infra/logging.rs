//! `tracing` + `tracing-subscriber` setup shared by the build path and the
//! query engine. Build-path fan-out (`fill_indexes`, `fill_missing_bitmaps`,
//! `finalize`) and query-path stages (`compile`, `evaluate`, action
//! execution) emit `tracing::debug!`/`info!` spans carrying partition id,
//! row counts and timings.

use tracing_subscriber::EnvFilter;

/// Installs a global `fmt` subscriber honoring `RUST_LOG` (defaulting to
/// `info` when unset). Safe to call more than once - subsequent calls are
/// no-ops, matching `tracing`'s own "already set" behavior for a global
/// default subscriber.
pub fn init_default() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_default_is_idempotent() {
        init_default();
        init_default();
    }
}
