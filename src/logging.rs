//! Tracing subscriber setup shared by the client and server binaries

use crate::config::LoggingConfig;
use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `level_override` (from `--log-level`) replaces `config.level`. Fails when
/// the filter does not parse, the log file cannot be opened, or a subscriber
/// is already installed.
pub fn init_logging(config: &LoggingConfig, level_override: Option<&str>) -> crate::Result<()> {
    let level = level_override.unwrap_or(&config.level);
    let filter = EnvFilter::try_new(level)
        .map_err(|e| crate::Error::Config(format!("Invalid log level '{}': {}", level, e)))?;

    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| crate::Error::Config(format!("Cannot open log file {}: {}", path, e)))?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format.as_str() {
        "compact" => registry
            .with(fmt::layer().compact().with_ansi(ansi).with_writer(writer))
            .try_init(),
        "pretty" => registry
            .with(fmt::layer().pretty().with_ansi(ansi).with_writer(writer))
            .try_init(),
        _ => registry
            .with(fmt::layer().with_ansi(ansi).with_writer(writer))
            .try_init(),
    };

    result.map_err(|e| crate::Error::Config(format!("Failed to install logger: {}", e)))
}
