//! Global tracing subscriber setup.
//!
//! Storage and worker code log through the `log` facade; the pipeline uses
//! `tracing` spans. [`init`] installs one subscriber for both.

use std::str::FromStr;

use tracing_log::LogTracer;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

use crate::error::LoggingError;

pub const DEFAULT_FILTER: &str = "geocatalog=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(LoggingError::InvalidFilter {
                filter: other.to_string(),
                reason: "expected 'compact' or 'json'".to_string(),
            }),
        }
    }
}

/// An explicit filter wins; otherwise `RUST_LOG`, then [`DEFAULT_FILTER`].
pub fn build_filter(filter: Option<&str>) -> Result<EnvFilter, LoggingError> {
    match filter {
        Some(directives) => {
            EnvFilter::try_new(directives).map_err(|e| LoggingError::InvalidFilter {
                filter: directives.to_string(),
                reason: e.to_string(),
            })
        }
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

/// Installs the global subscriber and the `log` bridge. Fails if either is
/// already installed.
pub fn init(format: LogFormat, filter: Option<&str>) -> Result<(), LoggingError> {
    let filter = build_filter(filter)?;

    LogTracer::init().map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Compact => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().compact().with_target(true)),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(true).with_span_list(false)),
        ),
    };
    installed.map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))
}
