use std::path::Path;

use timbel_config::Config;
use timbel_types::{Result, TimbelError};
use tracing_appender::rolling;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing/logging system.
///
/// Sets up a console layer (ANSI text or JSON) and an optional daily-rolling
/// file layer. `RUST_LOG` takes precedence over `log_level`.
pub fn init_logging(log_level: &str, log_file: Option<&Path>, structured: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let console_layer = if structured {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(true)
            .boxed()
    };

    let file_layer = log_file.map(|log_path| {
        let dir = log_path.parent().unwrap_or(Path::new("."));
        let filename = log_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "timbel.log".to_string());

        let file_appender = rolling::daily(dir, &filename);
        if structured {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_appender)
                .with_target(true)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_target(true)
                .with_ansi(false)
                .boxed()
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| TimbelError::Config(format!("Failed to install tracing subscriber: {e}")))
}

/// Initialize logging from the loaded configuration.
pub fn init_logging_from(config: &Config) -> Result<()> {
    init_logging(
        &config.log_level,
        config.log_file.as_deref(),
        config.log_structured,
    )
}
