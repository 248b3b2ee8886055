//! Tracing subscriber setup.
//!
//! `RUST_LOG` overrides the configured level.

use contactsync_engine::config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{CliError, CliResult};

/// Install the global subscriber. Logs go to stderr so reports on stdout stay
/// machine-readable.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> CliResult<()> {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| CliError::Config(format!("invalid log level '{level}': {e}")))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format.as_str() {
        "json" => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .flatten_event(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        "pretty" => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
        other => {
            return Err(CliError::Config(format!(
                "unknown log format '{other}', expected 'json' or 'pretty'"
            )))
        }
    };
    result.map_err(|e| CliError::Config(format!("failed to initialize logging: {e}")))
}
