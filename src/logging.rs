// src/logging.rs

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,trafficflow=debug";

/// Sends log records to stderr so stdout stays free for progress and the final report.
/// `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
