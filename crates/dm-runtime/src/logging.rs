#![forbid(unsafe_code)]

//! Process-wide `tracing` subscriber setup for dm binaries.
//!
//! Libraries only emit events; a binary calls [`init`] once at startup.
//! The filter uses `RUST_LOG` syntax (`info`, `dm_core=debug,warn`, ...).

use std::fmt;

use tracing_subscriber::EnvFilter;

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `RUST_LOG`-style filter directive.
    pub filter: String,
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl LogConfig {
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Error installing the global subscriber.
#[derive(Debug)]
pub enum LoggingError {
    /// The filter string does not parse.
    InvalidFilter(String),
    /// A global subscriber is already installed.
    AlreadyInitialized,
}

impl fmt::Display for LoggingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFilter(msg) => write!(f, "invalid log filter: {msg}"),
            Self::AlreadyInitialized => write!(f, "a global tracing subscriber is already set"),
        }
    }
}

impl std::error::Error for LoggingError {}

/// Parse `config.filter` into an [`EnvFilter`].
pub fn filter(config: &LogConfig) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(&config.filter).map_err(|e| LoggingError::InvalidFilter(e.to_string()))
}

/// Install the global subscriber. Output goes to stderr so stdout stays free
/// for journal lines.
pub fn init(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|_| LoggingError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        assert!(filter(&LogConfig::default()).is_ok());
        assert!(filter(&LogConfig::default().with_filter("dm_core=debug,warn")).is_ok());
    }

    #[test]
    fn bad_filter_is_rejected() {
        let err = filter(&LogConfig::default().with_filter("dm_core=notalevel")).unwrap_err();
        assert!(matches!(err, LoggingError::InvalidFilter(_)));
    }

    #[test]
    fn second_init_reports_already_initialized() {
        let config = LogConfig::default().with_filter("warn");
        let first = init(&config);
        let second = init(&config);
        // The first may lose to another test's subscriber; the second never wins.
        assert!(first.is_ok() || matches!(first, Err(LoggingError::AlreadyInitialized)));
        assert!(matches!(second, Err(LoggingError::AlreadyInitialized)));
    }
}
