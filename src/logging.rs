//! Tracing setup.
//!
//! The driver logs through `tracing`; applications pick a subscriber. This
//! module provides a ready-made one: an `EnvFilter` (honouring `RUST_LOG`)
//! in front of a pretty, compact or JSON formatter.
//!
//! # Example
//! ```no_run
//! use lms_driver::{config::DriverConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DriverConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("driver ready");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::DriverConfig;

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (development)
    Pretty,
    /// One line per event, no colors
    Compact,
    /// JSON objects for log aggregation
    Json,
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit span open/close events (useful for PLL and MCU sequences)
    pub with_span_events: bool,
    /// Include file and line numbers
    pub with_file_and_line: bool,
    /// Include thread names (`lms-rx`, `lms-tx`)
    pub with_thread_names: bool,
    /// ANSI colors (pretty format only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Options derived from the `[logging]` section.
    pub fn from_driver_config(config: &DriverConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.logging.level)?,
            format: parse_format(&config.logging.format)?,
            with_span_events: config.logging.span_events,
            ..Default::default()
        })
    }
}

/// Initialize logging from the `[logging]` section of `config`.
pub fn init_from_config(config: &DriverConfig) -> Result<(), String> {
    init(LoggingConfig::from_driver_config(config)?)
}

/// Install a global subscriber.
///
/// Idempotent: if a global subscriber is already set (tests, host
/// applications), returns `Ok(())` and leaves it in place.
pub fn init(config: LoggingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            // Expected in tests and when the host application set its own subscriber
            if e.to_string().contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(format!("Failed to initialize logging: {e}"))
            }
        })
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}

fn parse_format(format: &str) -> Result<OutputFormat, String> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        _ => Err(format!(
            "Invalid log format '{format}'. Must be one of: pretty, compact, json"
        )),
    }
}
