use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Installs a stderr `fmt` subscriber filtered by `RUST_LOG`, falling back to the configured level.
///
/// Stdout is reserved for the command stream when running as a peer, so nothing is ever
/// written there. Returns `false` when a global subscriber was already installed.
pub fn init(config: &Config) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .is_ok()
}
