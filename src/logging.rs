//! Tracing subscriber setup for host applications and the mobile bridges.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "zeroclaw_chat_sync=info";

/// Install a `fmt` subscriber filtered by `RUST_LOG`, or `default_filter`.
///
/// Safe to call more than once; later calls are no-ops if a global
/// subscriber is already set.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{default_filter}': {e}"))?;

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}
