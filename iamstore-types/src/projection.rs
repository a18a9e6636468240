//! Projection storage vocabulary: statements, rows, current sequences and
//! the failed-event ledger.
//!
//! Reducers never write to a backend directly. They emit [`Statement`]s which
//! the engine collects into a [`ProjectionBatch`]; the backend applies one batch
//! atomically together with the sequence advance and ledger changes.

use crate::ids::{EntityId, ProjectionName, Sequence, TenantId};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;

/// Idempotent change to one projection's rows for one tenant.
///
/// Statements carry no deltas, so re-applying the same statement leaves the
/// projection unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// Replace the whole document of a row, creating it if missing.
    Upsert {
        /// Row key.
        entity_id: EntityId,
        /// New document.
        data: Value,
    },
    /// Set top-level fields on an existing row. No-op when the row is missing.
    Merge {
        /// Row key.
        entity_id: EntityId,
        /// Fields to overwrite.
        fields: Map<String, Value>,
    },
    /// Remove a row. No-op when the row is missing.
    Delete {
        /// Row key.
        entity_id: EntityId,
    },
    /// Remove every row of the tenant.
    DeleteAll,
}

impl Statement {
    /// Row targeted by this statement, `None` for [`Statement::DeleteAll`].
    pub const fn entity_id(&self) -> Option<&EntityId> {
        match self {
            Self::Upsert { entity_id, .. }
            | Self::Merge { entity_id, .. }
            | Self::Delete { entity_id } => Some(entity_id),
            Self::DeleteAll => None,
        }
    }
}

/// A statement together with the event that produced it.
///
/// Rows remember the sequence of the last statement applied to them. A statement
/// whose sequence is lower than the row's is skipped, so retried events never
/// move a row back in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingStatement {
    /// Sequence of the producing event.
    pub sequence: Sequence,
    /// Commit timestamp of the producing event.
    pub created_at: DateTime<Utc>,
    /// The change.
    pub statement: Statement,
}

/// One materialized row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRow {
    /// Row key.
    pub entity_id: EntityId,
    /// Current document.
    pub data: Value,
    /// Sequence of the last event that changed the row.
    pub sequence: Sequence,
    /// Commit timestamp of that event.
    pub changed_at: DateTime<Utc>,
}

/// Position of one projection for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentSequence {
    /// Projection name.
    pub projection: ProjectionName,
    /// Tenant.
    pub tenant: TenantId,
    /// Last processed sequence.
    pub sequence: Sequence,
    /// When the sequence was last advanced.
    pub last_successful_run: DateTime<Utc>,
}

/// Ledger entry for an event a projection handler failed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEvent {
    /// Projection whose handler failed.
    pub projection: ProjectionName,
    /// Tenant of the event.
    pub tenant: TenantId,
    /// Sequence of the event.
    pub failed_sequence: Sequence,
    /// How many attempts failed.
    pub failure_count: u32,
    /// Message of the latest failure.
    pub error_message: String,
    /// Time of the latest failure.
    pub last_failed_at: DateTime<Utc>,
}

/// A handler failure to record in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFailure {
    /// Sequence of the event the handler failed on.
    pub sequence: Sequence,
    /// Error message.
    pub error_message: String,
}

/// Everything one catch-up step commits for one projection and tenant.
///
/// Applied in one transaction:
/// - every statement in order
/// - every failure (insert with count 1 or increment)
/// - every resolved sequence (ledger entry removed)
/// - the sequence advance to `advance_to`
///
/// When `advance_to` is set but not greater than the stored current sequence,
/// another runner already committed this range and nothing is applied. When it
/// is greater, statements and failures of events at or below the stored
/// sequence are dropped, since another runner committed those already.
///
/// Ledger retries carry no `advance_to`. They replay events up to the position
/// they read and set `replayed_through` to it; if the stored sequence has moved
/// since, the replay is outdated and nothing is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionBatch {
    /// Projection the batch belongs to.
    pub projection: ProjectionName,
    /// Tenant the batch belongs to.
    pub tenant: TenantId,
    /// Row changes in sequence order.
    pub statements: Vec<PendingStatement>,
    /// Handler failures to record.
    pub failures: Vec<HandlerFailure>,
    /// Ledger entries that now succeeded.
    pub resolved: Vec<Sequence>,
    /// New current sequence, if the batch covers new events.
    pub advance_to: Option<Sequence>,
    /// Position a replay was computed against, if the batch is a ledger retry.
    pub replayed_through: Option<Sequence>,
    /// Commit time recorded as last successful run and failure time.
    pub timestamp: DateTime<Utc>,
}

impl ProjectionBatch {
    /// Creates an empty batch.
    pub fn new(projection: ProjectionName, tenant: TenantId, timestamp: DateTime<Utc>) -> Self {
        Self {
            projection,
            tenant,
            statements: Vec::new(),
            failures: Vec::new(),
            resolved: Vec::new(),
            advance_to: None,
            replayed_through: None,
            timestamp,
        }
    }

    /// Returns true if committing the batch would change nothing.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
            && self.failures.is_empty()
            && self.resolved.is_empty()
            && self.advance_to.is_none()
    }

    /// Returns true if the batch is outdated against the `stored` sequence.
    pub fn is_stale_against(&self, stored: Sequence) -> bool {
        self.advance_to.is_some_and(|target| target <= stored)
            || self.replayed_through.is_some_and(|through| through != stored)
    }

    /// Drops statements and failures of events another runner committed up to
    /// `stored`. Batches without `advance_to` are left untouched.
    pub fn skip_committed(&mut self, stored: Sequence) {
        if self.advance_to.is_none() {
            return;
        }
        self.statements.retain(|pending| pending.sequence > stored);
        self.failures.retain(|failure| failure.sequence > stored);
    }
}

/// Result of [`ProjectionStore::commit_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchCommit {
    /// The batch was applied.
    Applied,
    /// The stored sequence had already reached `advance_to`; nothing was applied.
    Stale {
        /// Stored current sequence at commit time.
        current: Sequence,
    },
}

/// Storage for materialized projection rows.
pub trait ProjectionStore {
    /// Atomically apply a batch (see [`ProjectionBatch`]).
    fn commit_batch(
        &self,
        batch: ProjectionBatch,
    ) -> impl Future<Output = Result<BatchCommit, StoreError>> + Send;

    /// Read one row.
    fn row(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        entity_id: &EntityId,
    ) -> impl Future<Output = Result<Option<ProjectionRow>, StoreError>> + Send;

    /// Read every row of a tenant, ordered by entity id.
    fn rows(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
    ) -> impl Future<Output = Result<Vec<ProjectionRow>, StoreError>> + Send;

    /// Drop a projection's rows, current sequences and ledger entries for all
    /// tenants so the next catch-up rebuilds it from the start.
    fn reset(
        &self,
        projection: &ProjectionName,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Per (projection, tenant) bookkeeping of the last processed sequence.
pub trait SequenceTracker {
    /// Last processed sequence, zero if the projection never ran for the tenant.
    fn current_sequence(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
    ) -> impl Future<Output = Result<Sequence, StoreError>> + Send;

    /// Move the position forward. A sequence not greater than the stored one is a no-op.
    fn advance(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        sequence: Sequence,
        timestamp: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Every position, optionally restricted to one projection, ordered by
    /// projection then tenant.
    fn current_sequences(
        &self,
        projection: Option<&ProjectionName>,
    ) -> impl Future<Output = Result<Vec<CurrentSequence>, StoreError>> + Send;
}

/// Record of projection handler failures.
pub trait FailedEventLedger {
    /// Ledger entries, optionally restricted to one projection and/or tenant,
    /// ordered by projection, tenant and sequence.
    fn failed_events(
        &self,
        projection: Option<&ProjectionName>,
        tenant: Option<&TenantId>,
    ) -> impl Future<Output = Result<Vec<FailedEvent>, StoreError>> + Send;

    /// Delete an entry. Returns false if it did not exist.
    fn remove_failed_event(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        sequence: Sequence,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Set an entry's failure count back to zero. Returns false if it did not exist.
    fn reset_failure_count(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        sequence: Sequence,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> ProjectionBatch {
        ProjectionBatch::new(
            ProjectionName::try_new("users").expect("valid projection name"),
            TenantId::try_new("tenant-1").expect("valid tenant"),
            Utc::now(),
        )
    }

    #[test]
    fn new_batch_is_empty() {
        assert!(batch().is_empty());
    }

    #[test]
    fn batch_is_stale_when_target_already_reached() {
        let mut batch = batch();
        batch.advance_to = Some(Sequence::new(5));

        assert!(batch.is_stale_against(Sequence::new(5)));
        assert!(batch.is_stale_against(Sequence::new(9)));
        assert!(!batch.is_stale_against(Sequence::new(4)));
    }

    #[test]
    fn retry_batches_are_never_stale() {
        let mut batch = batch();
        batch.resolved.push(Sequence::new(3));

        assert!(!batch.is_empty());
        assert!(!batch.is_stale_against(Sequence::new(100)));
    }

    #[test]
    fn replays_are_stale_once_the_position_moves() {
        let mut batch = batch();
        batch.replayed_through = Some(Sequence::new(7));

        assert!(!batch.is_stale_against(Sequence::new(7)));
        assert!(batch.is_stale_against(Sequence::new(8)));
        assert!(batch.is_stale_against(Sequence::new(6)));
    }

    #[test]
    fn overlapping_batches_skip_already_committed_events() {
        // Given a batch covering events 1..=4 with failures at 2 and 4
        let mut batch = batch();
        batch.advance_to = Some(Sequence::new(4));
        batch.statements = (1..=4)
            .map(|sequence| PendingStatement {
                sequence: Sequence::new(sequence),
                created_at: Utc::now(),
                statement: Statement::DeleteAll,
            })
            .collect();
        batch.failures = [2, 4]
            .into_iter()
            .map(|sequence| HandlerFailure {
                sequence: Sequence::new(sequence),
                error_message: "broken".to_string(),
            })
            .collect();

        // When another runner already committed up to 2
        batch.skip_committed(Sequence::new(2));

        // Then only events 3 and 4 remain
        let statements: Vec<u64> = batch
            .statements
            .iter()
            .map(|pending| pending.sequence.into_inner())
            .collect();
        let failures: Vec<u64> = batch
            .failures
            .iter()
            .map(|failure| failure.sequence.into_inner())
            .collect();
        assert_eq!(statements, vec![3, 4]);
        assert_eq!(failures, vec![4]);
    }

    #[test]
    fn retry_batches_keep_everything_when_skipping() {
        let mut batch = batch();
        batch.failures.push(HandlerFailure {
            sequence: Sequence::new(2),
            error_message: "broken".to_string(),
        });

        batch.skip_committed(Sequence::new(9));

        assert_eq!(batch.failures.len(), 1);
    }

    #[test]
    fn delete_all_targets_no_single_entity() {
        assert_eq!(Statement::DeleteAll.entity_id(), None);
        let entity_id = EntityId::try_new("user-1").expect("valid entity id");
        assert_eq!(
            Statement::Delete {
                entity_id: entity_id.clone()
            }
            .entity_id(),
            Some(&entity_id)
        );
    }
}
