use chrono::{DateTime, Utc};
use iamstore_types::{
    AggregateId, AggregateType, AggregateVersion, AppendRequest, EditorId, EventLog, EventQuery,
    EventType, Operation, ResourceOwner, Sequence, StoreError, StoredEvent, TenantId,
    UniqueConstraintAction,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row, query, query_scalar};
use tracing::{debug, instrument, warn};

use crate::{
    PostgresStore, UNIQUE_VIOLATION, decode_error, from_db, has_code, map_sqlx_error, to_db,
};

const EVENT_COLUMNS: &str = "tenant_id, sequence, aggregate_type, aggregate_id, \
     aggregate_version, event_type, payload, editor_id, resource_owner, created_at";

impl EventLog for PostgresStore {
    #[instrument(
        name = "postgres.append",
        skip_all,
        fields(
            tenant = %request.tenant(),
            aggregate_id = %request.aggregate().aggregate_id,
            events = request.events().len()
        )
    )]
    async fn append(&self, request: AppendRequest) -> Result<Vec<StoredEvent>, StoreError> {
        let tenant = request.tenant().to_string();
        let aggregate = request.aggregate();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        // Locks the tenant row until commit.
        let last_sequence: i64 = query_scalar(
            "INSERT INTO iamstore_tenant_sequences (tenant_id, sequence) VALUES ($1, 0)
             ON CONFLICT (tenant_id) DO UPDATE SET sequence = iamstore_tenant_sequences.sequence
             RETURNING sequence",
        )
        .bind(&tenant)
        .fetch_one(&mut *tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::Append))?;

        let current_version: i64 = query_scalar(
            "SELECT COALESCE(MAX(aggregate_version), 0) FROM iamstore_events
             WHERE tenant_id = $1 AND aggregate_type = $2 AND aggregate_id = $3",
        )
        .bind(&tenant)
        .bind(aggregate.aggregate_type.to_string())
        .bind(aggregate.aggregate_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::Append))?;
        let current_version =
            AggregateVersion::new(from_db(current_version, "aggregate_version")?);

        if !request.expected_version().is_satisfied_by(current_version) {
            warn!(
                expected = %request.expected_version(),
                actual = %current_version,
                "[postgres.version_conflict] optimistic concurrency check failed"
            );
            return Err(StoreError::ConcurrencyConflict {
                aggregate_type: aggregate.aggregate_type.clone(),
                aggregate_id: aggregate.aggregate_id.clone(),
                expected: request.expected_version(),
                actual: Some(current_version),
            });
        }

        for action in request.constraints() {
            match action {
                UniqueConstraintAction::Claim(constraint) => {
                    let claimed = query(
                        "INSERT INTO iamstore_unique_constraints (tenant_id, constraint_type, field)
                         VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                    )
                    .bind(&tenant)
                    .bind(constraint.constraint_type.to_string())
                    .bind(constraint.field.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(|error| map_sqlx_error(error, Operation::UniqueConstraints))?
                    .rows_affected();
                    if claimed == 0 {
                        debug!(
                            constraint_type = %constraint.constraint_type,
                            "[postgres.unique_constraint] value already claimed"
                        );
                        return Err(StoreError::ConstraintViolation {
                            constraint_type: constraint.constraint_type.clone(),
                            field: constraint.field.clone(),
                        });
                    }
                }
                UniqueConstraintAction::Release(constraint) => {
                    let _ = query(
                        "DELETE FROM iamstore_unique_constraints
                         WHERE tenant_id = $1 AND constraint_type = $2 AND field = $3",
                    )
                    .bind(&tenant)
                    .bind(constraint.constraint_type.to_string())
                    .bind(constraint.field.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(|error| map_sqlx_error(error, Operation::UniqueConstraints))?;
                }
                UniqueConstraintAction::ReleaseTenant => {
                    let _ = query("DELETE FROM iamstore_unique_constraints WHERE tenant_id = $1")
                        .bind(&tenant)
                        .execute(&mut *tx)
                        .await
                        .map_err(|error| map_sqlx_error(error, Operation::UniqueConstraints))?;
                }
            }
        }

        let mut sequence = Sequence::new(from_db(last_sequence, "sequence")?);
        let mut version = current_version;
        let mut committed = Vec::with_capacity(request.events().len());
        for pending in request.events() {
            sequence = sequence.next();
            version = version.increment();
            let created_at: DateTime<Utc> = query_scalar(
                "INSERT INTO iamstore_events (tenant_id, sequence, aggregate_type, aggregate_id,
                     aggregate_version, event_type, payload, editor_id, resource_owner)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 RETURNING created_at",
            )
            .bind(&tenant)
            .bind(to_db(sequence.into_inner(), "sequence")?)
            .bind(aggregate.aggregate_type.to_string())
            .bind(aggregate.aggregate_id.to_string())
            .bind(to_db(version.into_inner(), "aggregate_version")?)
            .bind(pending.event_type.to_string())
            .bind(&pending.payload)
            .bind(pending.editor.to_string())
            .bind(aggregate.resource_owner.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(|error| {
                if has_code(&error, UNIQUE_VIOLATION) {
                    StoreError::ConcurrencyConflict {
                        aggregate_type: aggregate.aggregate_type.clone(),
                        aggregate_id: aggregate.aggregate_id.clone(),
                        expected: request.expected_version(),
                        actual: None,
                    }
                } else {
                    map_sqlx_error(error, Operation::Append)
                }
            })?;

            committed.push(StoredEvent {
                tenant: request.tenant().clone(),
                aggregate_type: aggregate.aggregate_type.clone(),
                aggregate_id: aggregate.aggregate_id.clone(),
                aggregate_version: version,
                sequence,
                event_type: pending.event_type.clone(),
                payload: pending.payload.clone(),
                created_at,
                editor: pending.editor.clone(),
                resource_owner: aggregate.resource_owner.clone(),
            });
        }

        let _ = query("UPDATE iamstore_tenant_sequences SET sequence = $2 WHERE tenant_id = $1")
            .bind(&tenant)
            .bind(to_db(sequence.into_inner(), "sequence")?)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Append))?;

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

        debug!(sequence = %sequence, "[postgres.append] events appended");
        Ok(committed)
    }

    #[instrument(name = "postgres.query", skip_all, fields(tenant = %query.tenant_id()))]
    async fn query(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT ");
        let _ = builder.push(EVENT_COLUMNS).push(" FROM iamstore_events");
        push_filters(&mut builder, query)?;
        let _ = builder.push(" ORDER BY sequence ASC");
        if let Some(limit) = query.max_events() {
            let limit = i64::try_from(limit.into_inner()).unwrap_or(i64::MAX);
            let _ = builder.push(" LIMIT ").push_bind(limit);
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Query))?;

        rows.iter().map(decode_event).collect()
    }

    #[instrument(name = "postgres.latest_sequence", skip_all, fields(tenant = %query.tenant_id()))]
    async fn latest_sequence(&self, query: &EventQuery) -> Result<Sequence, StoreError> {
        let mut builder =
            QueryBuilder::<Postgres>::new("SELECT COALESCE(MAX(sequence), 0) FROM iamstore_events");
        push_filters(&mut builder, query)?;

        let latest: i64 = builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::LatestSequence))?;

        Ok(Sequence::new(from_db(latest, "sequence")?))
    }

    #[instrument(name = "postgres.tenants", skip(self))]
    async fn tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        let tenants: Vec<String> = query_scalar(
            "SELECT tenant_id FROM iamstore_tenant_sequences WHERE sequence > 0 ORDER BY tenant_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ListTenants))?;

        tenants
            .into_iter()
            .map(|tenant| TenantId::try_new(tenant).map_err(|error| decode_error("tenant_id", error)))
            .collect()
    }
}

fn strings<T: ToString>(values: &[T]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

fn push_filters(
    builder: &mut QueryBuilder<'_, Postgres>,
    query: &EventQuery,
) -> Result<(), StoreError> {
    let _ = builder
        .push(" WHERE tenant_id = ")
        .push_bind(query.tenant_id().to_string());

    if !query.aggregate_type_filter().is_empty() {
        let _ = builder
            .push(" AND aggregate_type = ANY(")
            .push_bind(strings(query.aggregate_type_filter()))
            .push(")");
    }
    if !query.aggregate_id_filter().is_empty() {
        let _ = builder
            .push(" AND aggregate_id = ANY(")
            .push_bind(strings(query.aggregate_id_filter()))
            .push(")");
    }
    if !query.event_type_filter().is_empty() {
        let _ = builder
            .push(" AND event_type = ANY(")
            .push_bind(strings(query.event_type_filter()))
            .push(")");
    }
    if let Some(after) = query.after_sequence() {
        let _ = builder
            .push(" AND sequence > ")
            .push_bind(to_db(after.into_inner(), "sequence")?);
    }
    if let Some(up_to) = query.up_to_sequence() {
        let _ = builder
            .push(" AND sequence <= ")
            .push_bind(to_db(up_to.into_inner(), "sequence")?);
    }
    Ok(())
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|error| map_sqlx_error(error, Operation::Query))
}

fn decode_event(row: &PgRow) -> Result<StoredEvent, StoreError> {
    Ok(StoredEvent {
        tenant: TenantId::try_new(column::<String>(row, "tenant_id")?)
            .map_err(|error| decode_error("tenant_id", error))?,
        aggregate_type: AggregateType::try_new(column::<String>(row, "aggregate_type")?)
            .map_err(|error| decode_error("aggregate_type", error))?,
        aggregate_id: AggregateId::try_new(column::<String>(row, "aggregate_id")?)
            .map_err(|error| decode_error("aggregate_id", error))?,
        aggregate_version: AggregateVersion::new(from_db(
            column(row, "aggregate_version")?,
            "aggregate_version",
        )?),
        sequence: Sequence::new(from_db(column(row, "sequence")?, "sequence")?),
        event_type: EventType::try_new(column::<String>(row, "event_type")?)
            .map_err(|error| decode_error("event_type", error))?,
        payload: column::<Value>(row, "payload")?,
        created_at: column(row, "created_at")?,
        editor: EditorId::try_new(column::<String>(row, "editor_id")?)
            .map_err(|error| decode_error("editor_id", error))?,
        resource_owner: ResourceOwner::try_new(column::<String>(row, "resource_owner")?)
            .map_err(|error| decode_error("resource_owner", error))?,
    })
}
