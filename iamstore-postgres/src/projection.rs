use chrono::{DateTime, Utc};
use iamstore_types::{
    BatchCommit, CurrentSequence, EntityId, FailedEvent, FailedEventLedger, Operation,
    PendingStatement, ProjectionBatch, ProjectionName, ProjectionRow, ProjectionStore, Sequence,
    SequenceTracker, Statement, StoreError, TenantId,
};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, Row, query, query_scalar};
use tracing::{debug, info, instrument, warn};

use crate::{
    PostgresStore, UNDEFINED_TABLE, decode_error, from_db, has_code, map_sqlx_error, to_db,
};

/// Fully qualified table of a projection. Projection names are validated SQL
/// identifiers, so formatting them into statements is safe.
fn table_name(projection: &ProjectionName) -> String {
    format!("iamstore_projections.\"{projection}\"")
}

const ADVANCE_SQL: &str = "INSERT INTO iamstore_current_sequences AS stored
         (projection, tenant_id, sequence, last_successful_run)
     VALUES ($1, $2, $3, $4)
     ON CONFLICT (projection, tenant_id) DO UPDATE
     SET sequence = EXCLUDED.sequence, last_successful_run = EXCLUDED.last_successful_run
     WHERE stored.sequence < EXCLUDED.sequence";

impl PostgresStore {
    async fn ensure_table(
        &self,
        conn: &mut PgConnection,
        projection: &ProjectionName,
    ) -> Result<(), StoreError> {
        if self.known_tables.lock().contains(projection) {
            return Ok(());
        }

        // Concurrent CREATE TABLE IF NOT EXISTS can still collide in the catalog.
        let _ = query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(projection.to_string())
            .execute(&mut *conn)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitBatch))?;

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                 tenant_id TEXT NOT NULL,
                 entity_id TEXT NOT NULL,
                 data JSONB NOT NULL,
                 sequence BIGINT NOT NULL,
                 changed_at TIMESTAMPTZ NOT NULL,
                 PRIMARY KEY (tenant_id, entity_id)
             )",
            table_name(projection)
        );
        let _ = query(&ddl)
            .execute(&mut *conn)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitBatch))?;
        Ok(())
    }

    async fn stored_position(
        conn: &mut PgConnection,
        projection: &str,
        tenant: &str,
    ) -> Result<Sequence, StoreError> {
        let current: Option<i64> = query_scalar(
            "SELECT sequence FROM iamstore_current_sequences WHERE projection = $1 AND tenant_id = $2",
        )
        .bind(projection)
        .bind(tenant)
        .fetch_optional(conn)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::CurrentSequence))?;
        Ok(Sequence::new(from_db(current.unwrap_or(0), "sequence")?))
    }

    /// Locks the position row for the rest of the transaction and returns the
    /// stored sequence. Batches that advance create the row first, so two
    /// first-ever commits queue on it instead of both reading zero.
    async fn lock_position(
        conn: &mut PgConnection,
        projection: &str,
        tenant: &str,
        advance_to: Option<Sequence>,
        timestamp: DateTime<Utc>,
    ) -> Result<Sequence, StoreError> {
        if advance_to.is_some() {
            let _ = query(
                "INSERT INTO iamstore_current_sequences
                     (projection, tenant_id, sequence, last_successful_run)
                 VALUES ($1, $2, 0, $3)
                 ON CONFLICT (projection, tenant_id) DO NOTHING",
            )
            .bind(projection)
            .bind(tenant)
            .bind(timestamp)
            .execute(&mut *conn)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitBatch))?;
        }

        let current: Option<i64> = query_scalar(
            "SELECT sequence FROM iamstore_current_sequences
             WHERE projection = $1 AND tenant_id = $2 FOR UPDATE",
        )
        .bind(projection)
        .bind(tenant)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::CommitBatch))?;
        Ok(Sequence::new(from_db(current.unwrap_or(0), "sequence")?))
    }
}

async fn apply_statement(
    conn: &mut PgConnection,
    table: &str,
    tenant: &str,
    pending: &PendingStatement,
) -> Result<(), StoreError> {
    let sequence = to_db(pending.sequence.into_inner(), "sequence")?;
    // Every statement skips rows that already reflect a later event.
    let result = match &pending.statement {
        Statement::Upsert { entity_id, data } => {
            let sql = format!(
                "INSERT INTO {table} AS existing (tenant_id, entity_id, data, sequence, changed_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (tenant_id, entity_id) DO UPDATE
                 SET data = EXCLUDED.data, sequence = EXCLUDED.sequence,
                     changed_at = EXCLUDED.changed_at
                 WHERE existing.sequence <= EXCLUDED.sequence"
            );
            query(&sql)
                .bind(tenant)
                .bind(entity_id.to_string())
                .bind(data)
                .bind(sequence)
                .bind(pending.created_at)
                .execute(conn)
                .await
        }
        Statement::Merge { entity_id, fields } => {
            let sql = format!(
                "UPDATE {table}
                 SET data = CASE WHEN jsonb_typeof(data) = 'object' THEN data || $3 ELSE $3 END,
                     sequence = $4, changed_at = $5
                 WHERE tenant_id = $1 AND entity_id = $2 AND sequence <= $4"
            );
            query(&sql)
                .bind(tenant)
                .bind(entity_id.to_string())
                .bind(Json(fields))
                .bind(sequence)
                .bind(pending.created_at)
                .execute(conn)
                .await
        }
        Statement::Delete { entity_id } => {
            let sql = format!(
                "DELETE FROM {table} WHERE tenant_id = $1 AND entity_id = $2 AND sequence <= $3"
            );
            query(&sql)
                .bind(tenant)
                .bind(entity_id.to_string())
                .bind(sequence)
                .execute(conn)
                .await
        }
        Statement::DeleteAll => {
            let sql = format!("DELETE FROM {table} WHERE tenant_id = $1 AND sequence <= $2");
            query(&sql).bind(tenant).bind(sequence).execute(conn).await
        }
    };
    let _ = result.map_err(|error| map_sqlx_error(error, Operation::CommitBatch))?;
    Ok(())
}

fn decode_row(row: &PgRow) -> Result<ProjectionRow, StoreError> {
    let read = |error| map_sqlx_error(error, Operation::ReadProjection);
    Ok(ProjectionRow {
        entity_id: EntityId::try_new(row.try_get::<String, _>("entity_id").map_err(read)?)
            .map_err(|error| decode_error("entity_id", error))?,
        data: row.try_get("data").map_err(read)?,
        sequence: Sequence::new(from_db(
            row.try_get("sequence").map_err(read)?,
            "sequence",
        )?),
        changed_at: row.try_get("changed_at").map_err(read)?,
    })
}

impl ProjectionStore for PostgresStore {
    #[instrument(
        name = "postgres.commit_batch",
        skip_all,
        fields(
            projection = %batch.projection,
            tenant = %batch.tenant,
            statements = batch.statements.len()
        )
    )]
    async fn commit_batch(&self, mut batch: ProjectionBatch) -> Result<BatchCommit, StoreError> {
        let projection = batch.projection.to_string();
        let tenant = batch.tenant.to_string();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        // The position row lock serializes commits of the same
        // (projection, tenant) and yields the sequence to check staleness against.
        let current =
            Self::lock_position(&mut tx, &projection, &tenant, batch.advance_to, batch.timestamp)
                .await?;
        if batch.is_stale_against(current) {
            debug!(
                advance_to = ?batch.advance_to,
                replayed_through = ?batch.replayed_through,
                current = %current,
                "[postgres.commit_batch] batch is stale"
            );
            return Ok(BatchCommit::Stale { current });
        }
        batch.skip_committed(current);

        if let Some(target) = batch.advance_to {
            let _ = query(ADVANCE_SQL)
                .bind(&projection)
                .bind(&tenant)
                .bind(to_db(target.into_inner(), "sequence")?)
                .bind(batch.timestamp)
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::CommitBatch))?;
        }

        if !batch.statements.is_empty() {
            self.ensure_table(&mut tx, &batch.projection).await?;
            let table = table_name(&batch.projection);
            for pending in &batch.statements {
                if let Err(error) = apply_statement(&mut tx, &table, &tenant, pending).await {
                    // The table may have been dropped by a reset elsewhere.
                    let _ = self.known_tables.lock().remove(&batch.projection);
                    return Err(error);
                }
            }
        }

        for failure in &batch.failures {
            let _ = query(
                "INSERT INTO iamstore_failed_events AS failed
                     (projection, tenant_id, failed_sequence, failure_count, error_message, last_failed_at)
                 VALUES ($1, $2, $3, 1, $4, $5)
                 ON CONFLICT (projection, tenant_id, failed_sequence) DO UPDATE
                 SET failure_count = failed.failure_count + 1,
                     error_message = EXCLUDED.error_message,
                     last_failed_at = EXCLUDED.last_failed_at",
            )
            .bind(&projection)
            .bind(&tenant)
            .bind(to_db(failure.sequence.into_inner(), "failed_sequence")?)
            .bind(&failure.error_message)
            .bind(batch.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::FailedEvents))?;
        }

        if !batch.resolved.is_empty() {
            let resolved = batch
                .resolved
                .iter()
                .map(|sequence| to_db(sequence.into_inner(), "failed_sequence"))
                .collect::<Result<Vec<_>, _>>()?;
            let _ = query(
                "DELETE FROM iamstore_failed_events
                 WHERE projection = $1 AND tenant_id = $2 AND failed_sequence = ANY($3)",
            )
            .bind(&projection)
            .bind(&tenant)
            .bind(resolved)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::FailedEvents))?;
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

        if !batch.statements.is_empty() {
            let _ = self.known_tables.lock().insert(batch.projection.clone());
        }
        Ok(BatchCommit::Applied)
    }

    #[instrument(name = "postgres.row", skip(self))]
    async fn row(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        entity_id: &EntityId,
    ) -> Result<Option<ProjectionRow>, StoreError> {
        let sql = format!(
            "SELECT entity_id, data, sequence, changed_at FROM {}
             WHERE tenant_id = $1 AND entity_id = $2",
            table_name(projection)
        );
        match query(&sql)
            .bind(tenant.to_string())
            .bind(entity_id.to_string())
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row.as_ref().map(decode_row).transpose(),
            // Nothing was ever written to this projection.
            Err(error) if has_code(&error, UNDEFINED_TABLE) => Ok(None),
            Err(error) => Err(map_sqlx_error(error, Operation::ReadProjection)),
        }
    }

    #[instrument(name = "postgres.rows", skip(self))]
    async fn rows(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
    ) -> Result<Vec<ProjectionRow>, StoreError> {
        let sql = format!(
            "SELECT entity_id, data, sequence, changed_at FROM {}
             WHERE tenant_id = $1 ORDER BY entity_id",
            table_name(projection)
        );
        match query(&sql)
            .bind(tenant.to_string())
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows.iter().map(decode_row).collect(),
            Err(error) if has_code(&error, UNDEFINED_TABLE) => Ok(Vec::new()),
            Err(error) => Err(map_sqlx_error(error, Operation::ReadProjection)),
        }
    }

    #[instrument(name = "postgres.reset", skip(self))]
    async fn reset(&self, projection: &ProjectionName) -> Result<(), StoreError> {
        let name = projection.to_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        let drop = format!("DROP TABLE IF EXISTS {}", table_name(projection));
        let _ = query(&drop)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::ResetProjection))?;
        let _ = query("DELETE FROM iamstore_current_sequences WHERE projection = $1")
            .bind(&name)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::ResetProjection))?;
        let _ = query("DELETE FROM iamstore_failed_events WHERE projection = $1")
            .bind(&name)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::ResetProjection))?;

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;
        let _ = self.known_tables.lock().remove(projection);

        info!("[postgres.reset] projection dropped");
        Ok(())
    }
}

fn decode_position(row: &PgRow) -> Result<CurrentSequence, StoreError> {
    let read = |error| map_sqlx_error(error, Operation::CurrentSequence);
    Ok(CurrentSequence {
        projection: ProjectionName::try_new(row.try_get::<String, _>("projection").map_err(read)?)
            .map_err(|error| decode_error("projection", error))?,
        tenant: TenantId::try_new(row.try_get::<String, _>("tenant_id").map_err(read)?)
            .map_err(|error| decode_error("tenant_id", error))?,
        sequence: Sequence::new(from_db(
            row.try_get("sequence").map_err(read)?,
            "sequence",
        )?),
        last_successful_run: row.try_get("last_successful_run").map_err(read)?,
    })
}

impl SequenceTracker for PostgresStore {
    async fn current_sequence(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
    ) -> Result<Sequence, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Connect))?;
        Self::stored_position(&mut conn, &projection.to_string(), &tenant.to_string()).await
    }

    #[instrument(name = "postgres.advance", skip(self, timestamp))]
    async fn advance(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        sequence: Sequence,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _ = query(ADVANCE_SQL)
            .bind(projection.to_string())
            .bind(tenant.to_string())
            .bind(to_db(sequence.into_inner(), "sequence")?)
            .bind(timestamp)
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CurrentSequence))?;
        Ok(())
    }

    async fn current_sequences(
        &self,
        projection: Option<&ProjectionName>,
    ) -> Result<Vec<CurrentSequence>, StoreError> {
        let rows = query(
            "SELECT projection, tenant_id, sequence, last_successful_run
             FROM iamstore_current_sequences
             WHERE $1::text IS NULL OR projection = $1
             ORDER BY projection, tenant_id",
        )
        .bind(projection.map(ToString::to_string))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::CurrentSequence))?;

        rows.iter().map(decode_position).collect()
    }
}

fn decode_failed_event(row: &PgRow) -> Result<FailedEvent, StoreError> {
    let read = |error| map_sqlx_error(error, Operation::FailedEvents);
    let failure_count: i32 = row.try_get("failure_count").map_err(read)?;
    Ok(FailedEvent {
        projection: ProjectionName::try_new(row.try_get::<String, _>("projection").map_err(read)?)
            .map_err(|error| decode_error("projection", error))?,
        tenant: TenantId::try_new(row.try_get::<String, _>("tenant_id").map_err(read)?)
            .map_err(|error| decode_error("tenant_id", error))?,
        failed_sequence: Sequence::new(from_db(
            row.try_get("failed_sequence").map_err(read)?,
            "failed_sequence",
        )?),
        failure_count: u32::try_from(failure_count)
            .map_err(|error| decode_error("failure_count", error))?,
        error_message: row.try_get("error_message").map_err(read)?,
        last_failed_at: row.try_get("last_failed_at").map_err(read)?,
    })
}

impl FailedEventLedger for PostgresStore {
    async fn failed_events(
        &self,
        projection: Option<&ProjectionName>,
        tenant: Option<&TenantId>,
    ) -> Result<Vec<FailedEvent>, StoreError> {
        let rows = query(
            "SELECT projection, tenant_id, failed_sequence, failure_count, error_message, last_failed_at
             FROM iamstore_failed_events
             WHERE ($1::text IS NULL OR projection = $1) AND ($2::text IS NULL OR tenant_id = $2)
             ORDER BY projection, tenant_id, failed_sequence",
        )
        .bind(projection.map(ToString::to_string))
        .bind(tenant.map(ToString::to_string))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::FailedEvents))?;

        rows.iter().map(decode_failed_event).collect()
    }

    #[instrument(name = "postgres.remove_failed_event", skip(self))]
    async fn remove_failed_event(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        sequence: Sequence,
    ) -> Result<bool, StoreError> {
        let removed = query(
            "DELETE FROM iamstore_failed_events
             WHERE projection = $1 AND tenant_id = $2 AND failed_sequence = $3",
        )
        .bind(projection.to_string())
        .bind(tenant.to_string())
        .bind(to_db(sequence.into_inner(), "failed_sequence")?)
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::FailedEvents))?
        .rows_affected();
        Ok(removed > 0)
    }

    #[instrument(name = "postgres.reset_failure_count", skip(self))]
    async fn reset_failure_count(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        sequence: Sequence,
    ) -> Result<bool, StoreError> {
        let updated = query(
            "UPDATE iamstore_failed_events SET failure_count = 0
             WHERE projection = $1 AND tenant_id = $2 AND failed_sequence = $3",
        )
        .bind(projection.to_string())
        .bind(tenant.to_string())
        .bind(to_db(sequence.into_inner(), "failed_sequence")?)
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::FailedEvents))?
        .rows_affected();
        if updated == 0 {
            warn!("[postgres.reset_failure_count] no ledger entry to reset");
        }
        Ok(updated > 0)
    }
}
