//! Logging setup
//!
//! - `init` - installs the `tracing` subscriber used by the binary
//! - `LogThrottle` - suppresses repeated log lines while counting them

pub mod throttle;

pub use throttle::LogThrottle;

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to `verbosity`.
///
/// Returns an error if a global subscriber is already installed.
pub fn init(verbosity: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(verbosity))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
}
