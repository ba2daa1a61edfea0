//! Observability bootstrap for fabric processes.
//!
//! Call [`init`] once at startup, before any other fabric component runs.
//! The filter comes from `FABRIC_LOG` (falling back to `RUST_LOG`, then the
//! supplied default), so operators tune verbosity per process without
//! rebuilding.

#![warn(missing_docs, clippy::pedantic)]

use std::path::Path;

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive was invalid.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// The log file could not be opened.
    #[error("failed to open log file `{path}`: {reason}")]
    LogFile {
        /// Path that failed to open.
        path: String,
        /// Underlying reason.
        reason: String,
    },
    /// A global subscriber was already installed.
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Installs the global tracing subscriber for this process.
///
/// `default_filter` is used when neither `FABRIC_LOG` nor `RUST_LOG` is set,
/// e.g. `"info"` or `"info,fabric_supervisor=debug"`. When `log_file` is
/// given, output appends there instead of stderr.
///
/// # Errors
///
/// Returns [`TelemetryError`] when the filter is invalid, the log file is
/// unwritable, or a subscriber is already installed.
pub fn init(default_filter: &str, log_file: Option<&Path>) -> Result<(), TelemetryError> {
    let filter = filter_from_env(default_filter)?;

    let writer = if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TelemetryError::LogFile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        BoxMakeWriter::new(file)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))?;
    Ok(())
}

fn filter_from_env(default_filter: &str) -> Result<EnvFilter, TelemetryError> {
    if let Ok(directives) = std::env::var("FABRIC_LOG") {
        return EnvFilter::try_new(&directives)
            .map_err(|e| TelemetryError::Filter(format!("FABRIC_LOG `{directives}`: {e}")));
    }
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| TelemetryError::Filter(format!("`{default_filter}`: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        assert!(filter_from_env("info,fabric_runtime=debug").is_ok());
    }

    #[test]
    fn invalid_default_filter_errors() {
        // Only exercised when FABRIC_LOG and RUST_LOG are unset.
        if std::env::var("FABRIC_LOG").is_err() && std::env::var("RUST_LOG").is_err() {
            assert!(filter_from_env("fabric_runtime=notalevel").is_err());
        }
    }
}
