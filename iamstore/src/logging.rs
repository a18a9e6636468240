//! Process-wide `tracing` subscriber setup.
//!
//! Every iamstore component logs through `tracing` with bracketed event tags
//! (`[projection.catch_up]`, `[singleton.run]`, ...). The host process decides
//! where those records go; this module offers the common setup.

use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors from [`LoggingConfig::init`].
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The filter directive could not be parsed.
    #[error("invalid log filter '{filter}': {detail}")]
    InvalidFilter {
        /// The rejected directive.
        filter: String,
        /// Parser message.
        detail: String,
    },
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable, multi-line records (development).
    #[default]
    Pretty,
    /// One JSON object per record (production).
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,
    /// Output format.
    pub format: LogFormat,
    /// Whether to include the record's target (module path).
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Creates a new logging configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fallback filter directive
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Sets the output format
    #[must_use]
    pub const fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Builds the filter: `RUST_LOG` wins over the configured directive.
    pub fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.filter).map_err(|error| LoggingError::InvalidFilter {
            filter: self.filter.clone(),
            detail: error.to_string(),
        })
    }

    /// Installs the global subscriber.
    ///
    /// Safe to call multiple times; when a subscriber is already installed the
    /// call leaves it in place.
    pub fn init(&self) -> Result<(), LoggingError> {
        let filter = self.env_filter()?;
        let registry = tracing_subscriber::registry().with(filter);

        // try_init fails only when a global subscriber already exists
        let _already_installed = match self.format {
            LogFormat::Json => registry
                .with(fmt::layer().json().with_target(self.with_target))
                .try_init()
                .is_err(),
            LogFormat::Pretty => registry
                .with(fmt::layer().pretty().with_target(self.with_target))
                .try_init()
                .is_err(),
        };
        Ok(())
    }
}
