//! Process-wide logging setup for the worker binary.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Installs the global subscriber and routes `log` records into it.
/// `RUST_LOG` overrides the configured filter.
pub fn init_logging(config: &LoggingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| format!("invalid log filter '{}': {}", config.filter, e))?;

    if config.json {
        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().json().with_current_span(true))
            .with(filter);
        tracing::subscriber::set_global_default(subscriber).map_err(|e| e.to_string())?;
    } else {
        let format = fmt::format().with_target(true).compact();
        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().event_format(format))
            .with(filter);
        tracing::subscriber::set_global_default(subscriber).map_err(|e| e.to_string())?;
    }

    tracing_log::LogTracer::init().map_err(|e| e.to_string())
}
