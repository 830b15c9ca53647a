//! Structured logging setup, stdout-only (no file rotation layer — see
//! `DESIGN.md` for why `tracing-appender` was dropped from the stack).
//! The embedding host calls [`init`] once at startup; this crate's own
//! modules only ever call the `tracing` macros, never touch the
//! subscriber.

use std::io;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::CoreError;

/// Output format for the stdout log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Logging configuration, independent of [`crate::config::CoreConfig`] so
/// a host can initialize logging before configuration has finished
/// loading.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Initialize the global `tracing` subscriber.
///
/// Safe to call at most once per process; a second call returns an error
/// because `tracing_subscriber`'s global dispatcher can only be set once.
pub fn init(config: &LogConfig) -> Result<(), CoreError> {
    let default_level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    match config.format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(io::stdout)
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(env_filter);

            tracing_subscriber::registry()
                .with(layer)
                .try_init()
                .map_err(|e| CoreError::LoggingInit(format!("logger already initialized: {e}")))?;
        }
        LogFormat::Pretty => {
            let layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(io::stdout)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_filter(env_filter);

            tracing_subscriber::registry()
                .with(layer)
                .try_init()
                .map_err(|e| CoreError::LoggingInit(format!("logger already initialized: {e}")))?;
        }
    }

    tracing::info!(level = %config.level, format = ?config.format, "logger initialized");
    Ok(())
}

fn parse_log_level(level: &str) -> Result<Level, CoreError> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(CoreError::LoggingInit(format!("invalid log level: {other}"))),
    }
}
