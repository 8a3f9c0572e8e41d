//! Logging initialization.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

use crate::settings::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log level '{}'", config.level))?;

    match config.format.as_str() {
        "json" => init_json(config, filter),
        _ => init_text(config, filter),
    }
}

fn init_text(config: &LoggingConfig, filter: EnvFilter) -> Result<()> {
    let subscriber = Registry::default().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(config.enable_target)
            .with_thread_ids(config.enable_thread_ids),
    );

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::debug!("Console logging initialized");
    Ok(())
}

fn init_json(config: &LoggingConfig, filter: EnvFilter) -> Result<()> {
    let subscriber = Registry::default().with(filter).with(
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(config.enable_target)
            .with_thread_ids(config.enable_thread_ids),
    );

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::debug!("JSON logging initialized");
    Ok(())
}
