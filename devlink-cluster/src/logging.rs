//! Log subscriber setup for processes embedding the broker
//!
//! The library itself only emits `tracing` events. A binary installs a
//! subscriber once, before [`DeviceOperationBroker::connect`], usually via
//! [`BrokerConfig::init_logging`].
//!
//! [`DeviceOperationBroker::connect`]: crate::DeviceOperationBroker::connect
//! [`BrokerConfig::init_logging`]: crate::BrokerConfig::init_logging

use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Accepted values of `logging.format`
pub const LOG_FORMATS: [&str; 2] = ["pretty", "json"];

/// Install the global subscriber described by `config`
///
/// `RUST_LOG` overrides the configured level. Without it, broker and Redis
/// client events are logged at the configured level and everything else at
/// `warn`. Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = parse_log_level(&config.level)?;
    parse_log_format(&config.format)?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));
    let writer = make_writer(config.file_path.as_deref())?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if config.format == "json" {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(writer),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_line_number(true)
                    .with_file(false)
                    .with_writer(writer),
            )
            .try_init()
    };

    installed.map_err(|e| Error::Configuration(format!("Failed to install log subscriber: {e}")))
}

/// Filter used when `RUST_LOG` is unset
fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    format!("warn,devlink_cluster={level},redis={level}")
}

/// Append to `file_path` when set, stdout otherwise
fn make_writer(file_path: Option<&str>) -> Result<BoxMakeWriter> {
    let Some(path) = file_path else {
        return Ok(BoxMakeWriter::new(std::io::stdout));
    };
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(BoxMakeWriter::new(Arc::new(file)))
}

pub(crate) fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(Error::Configuration(format!("Invalid log level: {level}"))),
    }
}

pub(crate) fn parse_log_format(format: &str) -> Result<()> {
    if LOG_FORMATS.contains(&format) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "Invalid log format: {format}, expected one of {LOG_FORMATS:?}"
        )))
    }
}
