//! PostgreSQL backend for IAMStore.
//!
//! [`PostgresStore`] implements every capability trait on one connection
//! pool. Appends lock the tenant's sequence row, so sequence assignment and
//! unique constraint changes are serialized per tenant while different
//! tenants write in parallel. Each projection gets its own table in the
//! `iamstore_projections` schema, created on first write.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod event_log;
mod lock;
mod projection;

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use iamstore_types::{Operation, ProjectionName, StoreError};
use nutype::nutype;
use parking_lot::Mutex;
use serde::Deserialize;
use sqlx::{Pool, Postgres, postgres::PgPoolOptions, query};
use thiserror::Error;
use tracing::{error, info, instrument};

/// Failures while setting up a [`PostgresStore`]. The host should refuse to
/// start when one of these occurs.
#[derive(Debug, Error)]
pub enum PostgresStoreError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),
    /// Applying the schema migrations failed.
    #[error("failed to apply postgres migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Maximum number of database connections in the pool.
///
/// Zero connections are unrepresentable because the inner type is
/// [`NonZeroU32`].
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into, Deserialize))]
pub struct MaxConnections(NonZeroU32);

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// PostgreSQL implementation of `EventLog`, `ProjectionStore`,
/// `SequenceTracker`, `FailedEventLedger` and `TaskLock`.
///
/// Clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
    // Projection tables known to exist; skips the DDL round trip on every commit.
    known_tables: Arc<Mutex<HashSet<ProjectionName>>>,
}

impl PostgresStore {
    /// Connect with default pool configuration.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connect with custom pool configuration.
    #[instrument(name = "postgres.connect", skip_all)]
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresStoreError> {
        let connection_string = connection_string.into();
        let max_connections: NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresStoreError::ConnectionFailed)?;
        info!(
            max_connections = max_connections.get(),
            "[postgres.connect] connection pool ready"
        );
        Ok(Self::from_pool(pool))
    }

    /// Use an existing pool, e.g. one shared with other components.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            known_tables: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Apply the bundled schema migrations. Safe to call on every start.
    #[instrument(name = "postgres.migrate", skip(self))]
    pub async fn migrate(&self) -> Result<(), PostgresStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresStoreError::MigrationFailed)?;
        info!("[postgres.migrate] schema is up to date");
        Ok(())
    }

    /// Round trip to the database.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let _ = query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Connect))?;
        Ok(())
    }
}

const UNIQUE_VIOLATION: &str = "23505";
const UNDEFINED_TABLE: &str = "42P01";

fn has_code(error: &sqlx::Error, code: &str) -> bool {
    matches!(error, sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some(code))
}

fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> StoreError {
    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    StoreError::StoreFailure {
        operation,
        detail: error.to_string(),
    }
}

/// Positions and versions are `u64` in Rust and `BIGINT` in PostgreSQL.
fn to_db(value: u64, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidValue {
        detail: format!("{column} {value} exceeds BIGINT range"),
    })
}

fn from_db(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::InvalidValue {
        detail: format!("{column} {value} is negative"),
    })
}

fn decode_error(column: &str, error: impl std::fmt::Display) -> StoreError {
    StoreError::InvalidValue {
        detail: format!("{column}: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let config = PostgresConfig::default();

        assert_eq!(u32::from(NonZeroU32::from(config.max_connections)), 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn config_deserializes_partial_input() {
        let config: PostgresConfig =
            serde_json::from_str(r#"{ "max_connections": 25 }"#).expect("valid config");

        assert_eq!(config.max_connections.to_string(), "25");
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let result: Result<PostgresConfig, _> =
            serde_json::from_str(r#"{ "max_connections": 0 }"#);

        assert!(result.is_err());
    }

    #[test]
    fn negative_database_values_are_invalid() {
        assert!(matches!(
            from_db(-1, "sequence"),
            Err(StoreError::InvalidValue { .. })
        ));
        assert!(matches!(
            to_db(u64::MAX, "sequence"),
            Err(StoreError::InvalidValue { .. })
        ));
        assert_eq!(to_db(42, "sequence").ok(), Some(42));
    }

    #[test]
    fn store_failures_keep_the_operation() {
        let error = map_sqlx_error(sqlx::Error::PoolTimedOut, Operation::CommitBatch);

        assert!(matches!(
            error,
            StoreError::StoreFailure {
                operation: Operation::CommitBatch,
                ..
            }
        ));
        assert!(error.is_retryable());
    }
}
