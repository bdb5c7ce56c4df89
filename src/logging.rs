//! Logging setup
//!
//! Structured logging through `tracing`, with the subscriber installed once by the
//! binary. The library itself only emits events and spans; it never installs a
//! subscriber.
//!
//! - Multiple output formats (pretty, compact, JSON)
//! - `RUST_LOG` takes precedence over the configured level
//! - Idempotent initialization, so tests and embedding hosts can call it freely
//!
//! # Example
//! ```no_run
//! use scope_oiler::logging::{self, LoggingConfig, OutputFormat};
//! use tracing::Level;
//!
//! # fn main() -> scope_oiler::error::AppResult<()> {
//! logging::init(LoggingConfig::new(Level::DEBUG).with_format(OutputFormat::Compact))?;
//! tracing::info!("Oiler ready");
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, OilerError};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured (interactive use)
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            )),
        }
    }
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Most verbose level emitted
    pub level: Level,
    /// Line layout
    pub format: OutputFormat,
    /// Log span open/close (useful around device round-trips)
    pub with_span_events: bool,
    /// Source location on every line
    pub with_file_and_line: bool,
    /// Thread names tell the wireless thread apart from runtime workers
    pub with_thread_names: bool,
    /// ANSI colours; ignored for JSON
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install the global subscriber.
///
/// Returns `Ok(())` if one is already installed.
pub fn init(config: LoggingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_ascii_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Json => base.json().with_ansi(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            // Expected in tests and when a host application already installed one
            if e
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(OilerError::config(
                    "logging",
                    format!("failed to initialize tracing: {e}"),
                ))
            }
        })
}

/// Parse a level name (case-insensitive).
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    Level::from_str(level.trim()).map_err(|_| {
        OilerError::config(
            "log_level",
            format!("invalid level '{level}', expected trace, debug, info, warn or error"),
        )
    })
}
