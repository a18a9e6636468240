//! In-memory backend for IAMStore.
//!
//! [`InMemoryStore`] implements every capability trait behind a single mutex,
//! so each operation is trivially atomic. Useful for tests and single-node
//! deployments where persistence is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use iamstore_types::{
    AggregateId, AggregateType, AggregateVersion, AppendRequest, BatchCommit, CurrentSequence,
    EntityId, EventLog, EventQuery, FailedEvent, FailedEventLedger, LockKey, LockOutcome, Lease,
    OwnerId, ProjectionBatch, ProjectionName, ProjectionRow, ProjectionStore, Sequence,
    SequenceTracker, Statement, StoreError, StoredEvent, TaskLock, TenantId, UniqueConstraint,
    UniqueConstraintAction,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

type PositionKey = (ProjectionName, TenantId);
type FailureKey = (ProjectionName, TenantId, Sequence);

#[derive(Debug, Default)]
struct TenantLog {
    events: Vec<StoredEvent>,
    versions: HashMap<(AggregateType, AggregateId), AggregateVersion>,
    constraints: BTreeSet<UniqueConstraint>,
}

#[derive(Debug, Default)]
struct State {
    logs: BTreeMap<TenantId, TenantLog>,
    rows: HashMap<PositionKey, BTreeMap<EntityId, ProjectionRow>>,
    positions: BTreeMap<PositionKey, CurrentSequence>,
    failed: BTreeMap<FailureKey, FailedEvent>,
    leases: HashMap<LockKey, Lease>,
}

/// Thread-safe in-memory store implementing all IAMStore capabilities.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLog for InMemoryStore {
    #[instrument(name = "memory.append", skip_all, fields(tenant = %request.tenant(), aggregate_id = %request.aggregate().aggregate_id))]
    async fn append(&self, request: AppendRequest) -> Result<Vec<StoredEvent>, StoreError> {
        let mut state = self.state.lock();
        let log = state.logs.entry(request.tenant().clone()).or_default();
        let aggregate = request.aggregate();
        let version_key = (
            aggregate.aggregate_type.clone(),
            aggregate.aggregate_id.clone(),
        );

        let current = log
            .versions
            .get(&version_key)
            .copied()
            .unwrap_or_else(AggregateVersion::initial);
        if !request.expected_version().is_satisfied_by(current) {
            return Err(StoreError::ConcurrencyConflict {
                aggregate_type: aggregate.aggregate_type.clone(),
                aggregate_id: aggregate.aggregate_id.clone(),
                expected: request.expected_version(),
                actual: Some(current),
            });
        }

        let constraints = apply_constraint_actions(&log.constraints, request.constraints())?;

        let created_at = Utc::now();
        let mut version = current;
        let mut sequence = log
            .events
            .last()
            .map_or_else(Sequence::zero, |event| event.sequence);
        let mut committed = Vec::with_capacity(request.events().len());
        for pending in request.events() {
            version = version.increment();
            sequence = sequence.next();
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

        log.events.extend(committed.iter().cloned());
        let _ = log.versions.insert(version_key, version);
        log.constraints = constraints;

        debug!(
            events = committed.len(),
            sequence = %sequence,
            "[memory.append] events appended"
        );
        Ok(committed)
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError> {
        let state = self.state.lock();
        let Some(log) = state.logs.get(query.tenant_id()) else {
            return Ok(Vec::new());
        };

        let matching = log.events.iter().filter(|event| query.matches(event)).cloned();
        Ok(match query.max_events() {
            Some(limit) => matching.take(limit.into_inner()).collect(),
            None => matching.collect(),
        })
    }

    async fn latest_sequence(&self, query: &EventQuery) -> Result<Sequence, StoreError> {
        let state = self.state.lock();
        Ok(state
            .logs
            .get(query.tenant_id())
            .and_then(|log| log.events.iter().rev().find(|event| query.matches(event)))
            .map_or_else(Sequence::zero, |event| event.sequence))
    }

    async fn tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .logs
            .iter()
            .filter(|(_, log)| !log.events.is_empty())
            .map(|(tenant, _)| tenant.clone())
            .collect())
    }
}

/// Applies constraint actions in order to a copy of the tenant's claims.
fn apply_constraint_actions(
    claimed: &BTreeSet<UniqueConstraint>,
    actions: &[UniqueConstraintAction],
) -> Result<BTreeSet<UniqueConstraint>, StoreError> {
    let mut claimed = claimed.clone();
    for action in actions {
        match action {
            UniqueConstraintAction::Claim(constraint) => {
                if !claimed.insert(constraint.clone()) {
                    return Err(StoreError::ConstraintViolation {
                        constraint_type: constraint.constraint_type.clone(),
                        field: constraint.field.clone(),
                    });
                }
            }
            UniqueConstraintAction::Release(constraint) => {
                let _ = claimed.remove(constraint);
            }
            UniqueConstraintAction::ReleaseTenant => claimed.clear(),
        }
    }
    Ok(claimed)
}

impl ProjectionStore for InMemoryStore {
    #[instrument(name = "memory.commit_batch", skip_all, fields(projection = %batch.projection, tenant = %batch.tenant))]
    async fn commit_batch(&self, mut batch: ProjectionBatch) -> Result<BatchCommit, StoreError> {
        let mut state = self.state.lock();
        let key = (batch.projection.clone(), batch.tenant.clone());

        let current = state
            .positions
            .get(&key)
            .map_or_else(Sequence::zero, |position| position.sequence);
        if batch.is_stale_against(current) {
            return Ok(BatchCommit::Stale { current });
        }
        batch.skip_committed(current);

        let rows = state.rows.entry(key.clone()).or_default();
        for pending in &batch.statements {
            apply_statement(rows, &pending.statement, pending.sequence, pending.created_at);
        }

        for failure in &batch.failures {
            let _ = state
                .failed
                .entry((key.0.clone(), key.1.clone(), failure.sequence))
                .and_modify(|entry| {
                    entry.failure_count = entry.failure_count.saturating_add(1);
                    entry.error_message.clone_from(&failure.error_message);
                    entry.last_failed_at = batch.timestamp;
                })
                .or_insert_with(|| FailedEvent {
                    projection: key.0.clone(),
                    tenant: key.1.clone(),
                    failed_sequence: failure.sequence,
                    failure_count: 1,
                    error_message: failure.error_message.clone(),
                    last_failed_at: batch.timestamp,
                });
        }

        for sequence in &batch.resolved {
            let _ = state
                .failed
                .remove(&(key.0.clone(), key.1.clone(), *sequence));
        }

        if let Some(target) = batch.advance_to {
            advance_position(&mut state.positions, key, target, batch.timestamp);
        }

        Ok(BatchCommit::Applied)
    }

    async fn row(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        entity_id: &EntityId,
    ) -> Result<Option<ProjectionRow>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .rows
            .get(&(projection.clone(), tenant.clone()))
            .and_then(|rows| rows.get(entity_id))
            .cloned())
    }

    async fn rows(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
    ) -> Result<Vec<ProjectionRow>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .rows
            .get(&(projection.clone(), tenant.clone()))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn reset(&self, projection: &ProjectionName) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.rows.retain(|(name, _), _| name != projection);
        state.positions.retain(|(name, _), _| name != projection);
        state.failed.retain(|(name, _, _), _| name != projection);
        Ok(())
    }
}

/// Applies one statement unless the row already reflects a later event.
fn apply_statement(
    rows: &mut BTreeMap<EntityId, ProjectionRow>,
    statement: &Statement,
    sequence: Sequence,
    changed_at: DateTime<Utc>,
) {
    let is_newer = |row: &ProjectionRow| row.sequence > sequence;

    match statement {
        Statement::Upsert { entity_id, data } => {
            if rows.get(entity_id).is_some_and(is_newer) {
                return;
            }
            let _ = rows.insert(
                entity_id.clone(),
                ProjectionRow {
                    entity_id: entity_id.clone(),
                    data: data.clone(),
                    sequence,
                    changed_at,
                },
            );
        }
        Statement::Merge { entity_id, fields } => {
            let Some(row) = rows.get_mut(entity_id) else {
                return;
            };
            if is_newer(row) {
                return;
            }
            merge_fields(&mut row.data, fields);
            row.sequence = sequence;
            row.changed_at = changed_at;
        }
        Statement::Delete { entity_id } => {
            if rows.get(entity_id).is_some_and(|row| !is_newer(row)) {
                let _ = rows.remove(entity_id);
            }
        }
        Statement::DeleteAll => rows.retain(|_, row| is_newer(row)),
    }
}

fn merge_fields(data: &mut Value, fields: &Map<String, Value>) {
    if let Value::Object(object) = data {
        for (field, value) in fields {
            let _ = object.insert(field.clone(), value.clone());
        }
    } else {
        *data = Value::Object(fields.clone());
    }
}

fn advance_position(
    positions: &mut BTreeMap<PositionKey, CurrentSequence>,
    key: PositionKey,
    sequence: Sequence,
    timestamp: DateTime<Utc>,
) {
    match positions.get_mut(&key) {
        Some(position) if position.sequence >= sequence => {}
        Some(position) => {
            position.sequence = sequence;
            position.last_successful_run = timestamp;
        }
        None => {
            let (projection, tenant) = key.clone();
            let _ = positions.insert(
                key,
                CurrentSequence {
                    projection,
                    tenant,
                    sequence,
                    last_successful_run: timestamp,
                },
            );
        }
    }
}

impl SequenceTracker for InMemoryStore {
    async fn current_sequence(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
    ) -> Result<Sequence, StoreError> {
        let state = self.state.lock();
        Ok(state
            .positions
            .get(&(projection.clone(), tenant.clone()))
            .map_or_else(Sequence::zero, |position| position.sequence))
    }

    async fn advance(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        sequence: Sequence,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        advance_position(
            &mut state.positions,
            (projection.clone(), tenant.clone()),
            sequence,
            timestamp,
        );
        Ok(())
    }

    async fn current_sequences(
        &self,
        projection: Option<&ProjectionName>,
    ) -> Result<Vec<CurrentSequence>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .positions
            .values()
            .filter(|position| projection.is_none_or(|name| &position.projection == name))
            .cloned()
            .collect())
    }
}

impl FailedEventLedger for InMemoryStore {
    async fn failed_events(
        &self,
        projection: Option<&ProjectionName>,
        tenant: Option<&TenantId>,
    ) -> Result<Vec<FailedEvent>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .failed
            .values()
            .filter(|entry| projection.is_none_or(|name| &entry.projection == name))
            .filter(|entry| tenant.is_none_or(|tenant| &entry.tenant == tenant))
            .cloned()
            .collect())
    }

    async fn remove_failed_event(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        sequence: Sequence,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        Ok(state
            .failed
            .remove(&(projection.clone(), tenant.clone(), sequence))
            .is_some())
    }

    async fn reset_failure_count(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        sequence: Sequence,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        Ok(state
            .failed
            .get_mut(&(projection.clone(), tenant.clone(), sequence))
            .map(|entry| entry.failure_count = 0)
            .is_some())
    }
}

impl TaskLock for InMemoryStore {
    #[instrument(name = "memory.try_acquire", skip(self))]
    async fn try_acquire(
        &self,
        key: &LockKey,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<LockOutcome, StoreError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|error| StoreError::InvalidValue {
            detail: format!("lock ttl: {error}"),
        })?;
        let mut state = self.state.lock();
        let now = Utc::now();

        let holder = state
            .leases
            .get(key)
            .filter(|lease| lease.expires_at > now && &lease.owner != owner)
            .map(|lease| lease.owner.clone());
        if holder.is_some() {
            return Ok(LockOutcome::Denied { holder });
        }

        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| StoreError::InvalidValue {
                detail: format!("lock ttl {ttl} overflows the lease expiry"),
            })?;
        let lease = Lease {
            key: key.clone(),
            owner: owner.clone(),
            expires_at,
        };
        let _ = state.leases.insert(key.clone(), lease.clone());
        Ok(LockOutcome::Granted(lease))
    }

    async fn release(&self, key: &LockKey, owner: &OwnerId) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        if state.leases.get(key).is_some_and(|lease| &lease.owner == owner) {
            let _ = state.leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
