use std::time::Duration;

use chrono::{DateTime, Utc};
use iamstore_types::{Lease, LockKey, LockOutcome, Operation, OwnerId, StoreError, TaskLock};
use sqlx::{query, query_as, query_scalar};
use tracing::{debug, instrument};

use crate::{PostgresStore, decode_error, map_sqlx_error};

// Expiry is computed with the database clock so instances with skewed clocks
// agree on when a lease ends.
const ACQUIRE_SQL: &str = "INSERT INTO iamstore_task_locks AS held (resource_key, owner_id, expires_at)
     VALUES ($1, $2, now() + $3::float8 * interval '1 microsecond')
     ON CONFLICT (resource_key) DO UPDATE
     SET owner_id = EXCLUDED.owner_id, expires_at = EXCLUDED.expires_at
     WHERE held.expires_at <= now() OR held.owner_id = EXCLUDED.owner_id
     RETURNING owner_id, expires_at";

impl TaskLock for PostgresStore {
    #[instrument(name = "postgres.try_acquire", skip(self))]
    async fn try_acquire(
        &self,
        key: &LockKey,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<LockOutcome, StoreError> {
        let ttl_micros = i64::try_from(ttl.as_micros()).map_err(|_| StoreError::InvalidValue {
            detail: format!("lock ttl {ttl:?} is too large"),
        })?;

        let granted: Option<(String, DateTime<Utc>)> = query_as(ACQUIRE_SQL)
            .bind(key.to_string())
            .bind(owner.to_string())
            .bind(ttl_micros)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::AcquireLock))?;

        if let Some((holder, expires_at)) = granted {
            return Ok(LockOutcome::Granted(Lease {
                key: key.clone(),
                owner: OwnerId::try_new(holder).map_err(|error| decode_error("owner_id", error))?,
                expires_at,
            }));
        }

        // The holder may release between the two statements; then it is unknown.
        let holder: Option<String> =
            query_scalar("SELECT owner_id FROM iamstore_task_locks WHERE resource_key = $1")
                .bind(key.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::AcquireLock))?;
        let holder = holder
            .map(OwnerId::try_new)
            .transpose()
            .map_err(|error| decode_error("owner_id", error))?;

        debug!(holder = ?holder, "[postgres.try_acquire] lock is held");
        Ok(LockOutcome::Denied { holder })
    }

    #[instrument(name = "postgres.release", skip(self))]
    async fn release(&self, key: &LockKey, owner: &OwnerId) -> Result<bool, StoreError> {
        let released =
            query("DELETE FROM iamstore_task_locks WHERE resource_key = $1 AND owner_id = $2")
                .bind(key.to_string())
                .bind(owner.to_string())
                .execute(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::ReleaseLock))?
                .rows_affected();
        Ok(released > 0)
    }
}
