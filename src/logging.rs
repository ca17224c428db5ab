//! Logging configuration and initialization.
//!
//! Sets up the tracing subscriber from [`LoggingConfig`]: stdout, stderr or
//! file output through a non-blocking writer, in pretty, compact or JSON
//! form. `RUST_LOG` takes precedence over the configured level.

use crate::config::{LogFormat, LoggingConfig};
use std::fs::OpenOptions;
use std::io;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Initializes the logging system based on configuration.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure all logs are flushed.
///
/// # Arguments
///
/// * `config` - The logging configuration
/// * `level_override` - Optional level override from CLI/environment
/// * `trace_deps` - If true, include verbose logging from dependencies
///
/// # Example
///
/// ```ignore
/// let config = LoggingConfig::default();
/// let _guard = init_logging(&config, None, false)?;
/// tracing::info!("Logging initialized");
/// ```
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<String>,
    trace_deps: bool,
) -> io::Result<WorkerGuard> {
    let level = parse_level(level_override.as_deref().unwrap_or(&config.level));
    let directive = level.as_str().to_ascii_lowercase();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if trace_deps {
            EnvFilter::new(&directive)
        } else {
            // Keep the file watcher's internals quiet
            EnvFilter::new(format!("{},notify=warn,mio=warn", directive))
        }
    });

    let (writer, guard, to_file) = match config.output.to_lowercase().as_str() {
        "stdout" => {
            let (writer, guard) = tracing_appender::non_blocking(io::stdout());
            (writer, guard, false)
        }
        "stderr" => {
            let (writer, guard) = tracing_appender::non_blocking(io::stderr());
            (writer, guard, false)
        }
        _ => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.output)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            (writer, guard, true)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(config, writer, !to_file))
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    Ok(guard)
}

fn fmt_layer<S>(
    config: &LoggingConfig,
    writer: NonBlocking,
    ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_target);

    match (&config.format, config.timestamps) {
        (LogFormat::Json, true) => base.json().with_span_events(FmtSpan::CLOSE).boxed(),
        (LogFormat::Json, false) => base
            .json()
            .without_time()
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        (LogFormat::Compact, true) => base.compact().boxed(),
        (LogFormat::Compact, false) => base.compact().without_time().boxed(),
        (LogFormat::Pretty, true) => base.pretty().boxed(),
        (LogFormat::Pretty, false) => base.pretty().without_time().boxed(),
    }
}

/// Parses a log level string to a tracing Level.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
