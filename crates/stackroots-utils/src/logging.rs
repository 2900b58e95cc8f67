//! # Logging Utilities
//!
//! Subscriber setup for the `tracing` events the walker emits.
//!
//! Console output goes to stderr so that decoded tables and walk reports
//! printed on stdout stay machine-readable.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stackroots_utils::init_logging;
//!
//! // Reads RUST_LOG, STACKROOTS_LOG_FORMAT and STACKROOTS_LOG_FILE
//! init_logging().expect("Failed to initialize logging");
//!
//! tracing::info!("walker ready");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: level filter (e.g. `RUST_LOG=debug`, `RUST_LOG=stackroots_core::unwind=trace`)
//! - `STACKROOTS_LOG_FORMAT`: `pretty`, `compact` or `json` (default `pretty`)
//! - `STACKROOTS_LOG_FILE`: optional log file, rotated daily
//!
//! ## Examples
//!
//! ```rust,no_run
//! use stackroots_utils::{init_logging_with_level, LogFormat, LogLevel};
//!
//! init_logging_with_level(LogLevel::Trace, LogFormat::Compact).expect("Failed to initialize logging");
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Flushes the file writer; lives for the rest of the process once set.
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat
{
    /// Multi-line, human-readable (default)
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" => Ok(LogFormat::Pretty),
            "compact" | "short" => Ok(LogFormat::Compact),
            "json" | "prod" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(format!(
                "{s}. Use 'pretty', 'compact' or 'json'"
            ))),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel
{
    Error,
    Warn,
    /// Default
    Info,
    /// Per-frame and per-unwind-step events
    Debug,
    /// Every decoded table entry
    Trace,
}

impl LogLevel
{
    /// Level after `steps` increments of verbosity, saturating at `Trace`.
    #[must_use]
    pub fn more_verbose(self, steps: u8) -> Self
    {
        const ORDER: [LogLevel; 5] = [LogLevel::Error, LogLevel::Warn, LogLevel::Info, LogLevel::Debug, LogLevel::Trace];
        let index = ORDER.iter().position(|level| *level == self).unwrap_or(2);
        ORDER[(index + usize::from(steps)).min(ORDER.len() - 1)]
    }
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(format!(
                "{s}. Use 'error', 'warn', 'info', 'debug', or 'trace'"
            ))),
        }
    }
}

/// Initialize logging from the environment.
///
/// An unparsable `STACKROOTS_LOG_FORMAT` falls back to `pretty`; a plain
/// level in `RUST_LOG` becomes the default level and any other `RUST_LOG`
/// directive is used as the filter as is.
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging() -> Result<(), LoggingError>
{
    let format = env::var("STACKROOTS_LOG_FORMAT")
        .ok()
        .and_then(|s| LogFormat::from_str(&s).ok())
        .unwrap_or(LogFormat::Pretty);

    let default_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse::<LogLevel>().ok())
        .map_or(Level::INFO, Into::into);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    install(format, filter)
}

/// Initialize logging with an explicit level, ignoring `RUST_LOG`.
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<(), LoggingError>
{
    install(format, EnvFilter::new(Level::from(level).to_string()))
}

fn log_file_from_env() -> Option<PathBuf>
{
    env::var_os("STACKROOTS_LOG_FILE").map(PathBuf::from)
}

fn console_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stderr);
    match format {
        LogFormat::Pretty => layer.with_file(true).with_line_number(true).with_ansi(true).boxed(),
        LogFormat::Compact => layer.compact().with_ansi(true).boxed(),
        LogFormat::Json => layer.json().with_current_span(true).with_span_list(true).boxed(),
    }
}

fn file_layer<S>(format: LogFormat, path: &Path) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let directory = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let appender = tracing_appender::rolling::daily(directory, path.file_name().unwrap_or_default());
    let (writer, guard) = tracing_appender::non_blocking(appender);
    // A second initialization fails in `install`; its guard is dropped with the layer.
    let _ = FILE_GUARD.set(guard);

    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false);
    match format {
        LogFormat::Json => layer.json().with_current_span(true).boxed(),
        LogFormat::Pretty | LogFormat::Compact => layer.with_file(true).with_line_number(true).boxed(),
    }
}

fn install(format: LogFormat, filter: EnvFilter) -> Result<(), LoggingError>
{
    let file = log_file_from_env().map(|path| file_layer::<Registry>(format, &path));
    Registry::default()
        .with(console_layer::<Registry>(format).and_then(file).with_filter(filter))
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// A global subscriber is already installed
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
