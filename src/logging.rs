//! Logging configuration with optional file rotation
//!
//! Installs a global `tracing` subscriber: an [`EnvFilter`] seeded from the
//! configured level (`RUST_LOG` wins when set), compact or JSON output on
//! stderr, and an optional daily-rotated log file.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{ResilienceError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| ResilienceError::config(format!("invalid log filter: {e}")))
}

fn output_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    match format {
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer)
            .boxed(),
    }
}

/// Initialize logging with the given configuration.
///
/// The returned guard must be kept alive while file logging is wanted; it
/// flushes buffered lines when dropped.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(config)?;
    let mut layers: Vec<BoxedLayer> = vec![output_layer(config.format, std::io::stderr, true)];

    let guard = match &config.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(output_layer(config.format, writer, false));
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| ResilienceError::config(format!("failed to install subscriber: {e}")))?;

    Ok(guard)
}
