//! Configuration structs for the engine and the singleton workflow.
//!
//! Loading configuration is the host's concern; these structs only deserialize
//! and fall back to sensible defaults for every omitted field.

use crate::retry::RetryPolicy;
use iamstore_types::BatchSize;
use serde::Deserialize;
use std::time::Duration;

/// Configuration for the projection engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of events processed per committed batch.
    pub batch_size: BatchSize,
    /// Failed events are retried until they failed this many times, then parked.
    pub max_failure_count: u32,
    /// Background catch-up.
    pub spooler: SpoolerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: BatchSize::new(200),
            max_failure_count: 5,
            spooler: SpoolerConfig::default(),
        }
    }
}

/// Configuration for the background spooler.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SpoolerConfig {
    /// Time between two passes over all tenants and projections.
    pub interval: Duration,
    /// Catch-ups running at the same time within one pass.
    pub concurrency: usize,
    /// Whether the host should start the spooler at all.
    pub enabled: bool,
}

impl Default for SpoolerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            concurrency: 4,
            enabled: true,
        }
    }
}

/// Configuration for singleton generation workflows.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SingletonConfig {
    /// Lease duration; bounds how long a crashed holder blocks others.
    pub lock_ttl: Duration,
    /// Attempts and backoff for the read-decide-generate path.
    pub retry: RetryPolicy,
}

impl Default for SingletonConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(15),
            retry: RetryPolicy::fixed(3, Duration::from_millis(500)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_fills_omitted_fields() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "max_failure_count": 2 }"#).expect("valid config");

        assert_eq!(config.max_failure_count, 2);
        assert_eq!(config.batch_size, BatchSize::new(200));
        assert_eq!(config.spooler, SpoolerConfig::default());
    }

    #[test]
    fn singleton_default_retries_with_fixed_backoff() {
        let config = SingletonConfig::default();
        assert_eq!(config.retry.attempts(), 3);
        assert_eq!(config.retry.delay_for(2), Duration::from_millis(500));
    }
}
