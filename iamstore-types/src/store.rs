use crate::event::{AggregateRef, DomainEvent, PendingEvent, StoredEvent};
use crate::ids::{
    AggregateId, AggregateType, AggregateVersion, ConstraintField, ConstraintType, EditorId,
    EventType, Sequence, TenantId,
};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use thiserror::Error;

/// Optimistic concurrency expectation for an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// The aggregate must currently be at exactly this version.
    /// `Exact(AggregateVersion::initial())` requires that the aggregate does not exist yet.
    Exact(AggregateVersion),
    /// Skip the version check.
    Any,
}

impl ExpectedVersion {
    /// Returns true if an aggregate currently at `current` satisfies the expectation.
    pub fn is_satisfied_by(self, current: AggregateVersion) -> bool {
        match self {
            Self::Exact(expected) => expected == current,
            Self::Any => true,
        }
    }
}

impl From<AggregateVersion> for ExpectedVersion {
    fn from(version: AggregateVersion) -> Self {
        Self::Exact(version)
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(version) => write!(f, "{version}"),
            Self::Any => f.write_str("any"),
        }
    }
}

/// A tenant-scoped uniqueness claim, e.g. (`login_name`, `alice@example.com`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Category of the constraint.
    pub constraint_type: ConstraintType,
    /// Claimed value.
    pub field: ConstraintField,
}

impl UniqueConstraint {
    /// Creates a new unique constraint.
    pub const fn new(constraint_type: ConstraintType, field: ConstraintField) -> Self {
        Self {
            constraint_type,
            field,
        }
    }
}

/// Change to the unique constraint index committed together with an append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UniqueConstraintAction {
    /// Claim the value; the append fails if it is already claimed in the tenant.
    Claim(UniqueConstraint),
    /// Release a previously claimed value. Releasing an unclaimed value is a no-op.
    Release(UniqueConstraint),
    /// Release every constraint of the tenant (the tenant itself is being removed).
    ReleaseTenant,
}

/// Events to append to one aggregate, with its concurrency expectation and
/// unique constraint changes.
///
/// # Builder API
///
/// Methods return `Self` for clean chaining. Errors are accumulated internally
/// and returned by [`build()`](Self::build):
///
/// ```ignore
/// let request = AppendRequest::new(tenant, aggregate, ExpectedVersion::Exact(version))
///     .with_event(&editor, &UserEvent::Added { .. })
///     .claim_unique(login_name)
///     .build()?;
///
/// let committed = log.append(request).await?;
/// ```
#[derive(Debug, Clone)]
pub struct AppendRequest {
    tenant: TenantId,
    aggregate: AggregateRef,
    expected_version: ExpectedVersion,
    events: Vec<PendingEvent>,
    constraints: Vec<UniqueConstraintAction>,
    /// Accumulated errors from fluent builder methods, returned from build().
    builder_errors: Vec<StoreError>,
}

impl AppendRequest {
    /// Starts an append to `aggregate` in `tenant`.
    pub fn new(tenant: TenantId, aggregate: AggregateRef, expected_version: ExpectedVersion) -> Self {
        Self {
            tenant,
            aggregate,
            expected_version,
            events: Vec::new(),
            constraints: Vec::new(),
            builder_errors: Vec::new(),
        }
    }

    /// Serializes a typed domain event and adds it to the request.
    pub fn with_event<E: DomainEvent>(mut self, editor: &EditorId, event: &E) -> Self {
        match event.payload() {
            Ok(payload) => self.events.push(PendingEvent {
                event_type: event.event_type(),
                payload,
                editor: editor.clone(),
            }),
            Err(error) => self.builder_errors.push(StoreError::SerializationFailed {
                detail: format!("{}: {error}", event.event_type()),
            }),
        }
        self
    }

    /// Adds an already serialized event.
    pub fn with_pending_event(mut self, event: PendingEvent) -> Self {
        self.events.push(event);
        self
    }

    /// Claims a unique value for the tenant in the same transaction as the events.
    pub fn claim_unique(mut self, constraint: UniqueConstraint) -> Self {
        self.constraints
            .push(UniqueConstraintAction::Claim(constraint));
        self
    }

    /// Releases a unique value in the same transaction as the events.
    pub fn release_unique(mut self, constraint: UniqueConstraint) -> Self {
        self.constraints
            .push(UniqueConstraintAction::Release(constraint));
        self
    }

    /// Releases every unique value of the tenant in the same transaction as the events.
    pub fn release_tenant_constraints(mut self) -> Self {
        self.constraints.push(UniqueConstraintAction::ReleaseTenant);
        self
    }

    /// Finalize the builder and return the request if valid.
    ///
    /// # Errors
    ///
    /// - the first error recorded by [`with_event()`](Self::with_event)
    /// - [`StoreError::NothingToAppend`] if no event was added
    pub fn build(mut self) -> Result<Self, StoreError> {
        if !self.builder_errors.is_empty() {
            return Err(self.builder_errors.swap_remove(0));
        }
        if self.events.is_empty() {
            return Err(StoreError::NothingToAppend);
        }
        Ok(self)
    }

    /// Tenant the request writes to.
    pub const fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Aggregate the request writes to.
    pub const fn aggregate(&self) -> &AggregateRef {
        &self.aggregate
    }

    /// Concurrency expectation.
    pub const fn expected_version(&self) -> ExpectedVersion {
        self.expected_version
    }

    /// Events in append order.
    pub fn events(&self) -> &[PendingEvent] {
        &self.events
    }

    /// Unique constraint changes in declaration order.
    pub fn constraints(&self) -> &[UniqueConstraintAction] {
        &self.constraints
    }
}

/// Batch size domain type for limiting query results.
///
/// A batch size of zero is valid and will return an empty result set.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, Serialize, Deserialize))]
pub struct BatchSize(usize);

/// Filter over one tenant's log.
///
/// All set criteria must match (AND); each list matches any of its entries
/// (OR); an empty list matches everything. Results are ascending by sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    tenant: TenantId,
    aggregate_types: Vec<AggregateType>,
    aggregate_ids: Vec<AggregateId>,
    event_types: Vec<EventType>,
    after: Option<Sequence>,
    up_to: Option<Sequence>,
    limit: Option<BatchSize>,
}

impl EventQuery {
    /// Matches every event of `tenant`.
    pub const fn tenant(tenant: TenantId) -> Self {
        Self {
            tenant,
            aggregate_types: Vec::new(),
            aggregate_ids: Vec::new(),
            event_types: Vec::new(),
            after: None,
            up_to: None,
            limit: None,
        }
    }

    /// Restricts to the given aggregate types.
    #[must_use]
    pub fn aggregate_types(mut self, types: impl IntoIterator<Item = AggregateType>) -> Self {
        self.aggregate_types.extend(types);
        self
    }

    /// Restricts to the given aggregate instances.
    #[must_use]
    pub fn aggregate_ids(mut self, ids: impl IntoIterator<Item = AggregateId>) -> Self {
        self.aggregate_ids.extend(ids);
        self
    }

    /// Restricts to the given event types.
    #[must_use]
    pub fn event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types.extend(types);
        self
    }

    /// Only events with a sequence strictly greater than `sequence`.
    #[must_use]
    pub const fn after(mut self, sequence: Sequence) -> Self {
        self.after = Some(sequence);
        self
    }

    /// Only events with a sequence less than or equal to `sequence`.
    #[must_use]
    pub const fn up_to(mut self, sequence: Sequence) -> Self {
        self.up_to = Some(sequence);
        self
    }

    /// At most `limit` events.
    #[must_use]
    pub const fn limit(mut self, limit: BatchSize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Tenant being queried.
    pub const fn tenant_id(&self) -> &TenantId {
        &self.tenant
    }

    /// Aggregate type criteria.
    pub fn aggregate_type_filter(&self) -> &[AggregateType] {
        &self.aggregate_types
    }

    /// Aggregate id criteria.
    pub fn aggregate_id_filter(&self) -> &[AggregateId] {
        &self.aggregate_ids
    }

    /// Event type criteria.
    pub fn event_type_filter(&self) -> &[EventType] {
        &self.event_types
    }

    /// Exclusive lower bound.
    pub const fn after_sequence(&self) -> Option<Sequence> {
        self.after
    }

    /// Inclusive upper bound.
    pub const fn up_to_sequence(&self) -> Option<Sequence> {
        self.up_to
    }

    /// Page size.
    pub const fn max_events(&self) -> Option<BatchSize> {
        self.limit
    }

    /// Returns true if `event` satisfies every criterion except the limit.
    pub fn matches(&self, event: &StoredEvent) -> bool {
        event.tenant == self.tenant
            && (self.aggregate_types.is_empty()
                || self.aggregate_types.contains(&event.aggregate_type))
            && (self.aggregate_ids.is_empty() || self.aggregate_ids.contains(&event.aggregate_id))
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && self.after.is_none_or(|after| event.sequence > after)
            && self.up_to.is_none_or(|up_to| event.sequence <= up_to)
    }
}

/// Store operation that failed, for error reporting and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Connecting to the backing store.
    Connect,
    /// Opening a transaction.
    BeginTransaction,
    /// Committing a transaction.
    CommitTransaction,
    /// Appending events.
    Append,
    /// Changing the unique constraint index.
    UniqueConstraints,
    /// Querying events.
    Query,
    /// Reading the latest sequence.
    LatestSequence,
    /// Listing tenants.
    ListTenants,
    /// Committing a projection batch.
    CommitBatch,
    /// Reading projection rows.
    ReadProjection,
    /// Dropping a projection.
    ResetProjection,
    /// Reading or advancing current sequences.
    CurrentSequence,
    /// Reading or changing the failed-event ledger.
    FailedEvents,
    /// Acquiring a lock.
    AcquireLock,
    /// Releasing a lock.
    ReleaseLock,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::BeginTransaction => "begin_transaction",
            Self::CommitTransaction => "commit_transaction",
            Self::Append => "append",
            Self::UniqueConstraints => "unique_constraints",
            Self::Query => "query",
            Self::LatestSequence => "latest_sequence",
            Self::ListTenants => "list_tenants",
            Self::CommitBatch => "commit_batch",
            Self::ReadProjection => "read_projection",
            Self::ResetProjection => "reset_projection",
            Self::CurrentSequence => "current_sequence",
            Self::FailedEvents => "failed_events",
            Self::AcquireLock => "acquire_lock",
            Self::ReleaseLock => "release_lock",
        };
        f.write_str(name)
    }
}

/// Errors returned by every store capability.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Another writer changed the aggregate since the caller read it.
    /// Retryable: reload the aggregate and re-run the command.
    #[error(
        "concurrency conflict on {aggregate_type}/{aggregate_id}: expected version {expected}, found {}",
        actual.map_or_else(|| "unknown".to_string(), |version| version.to_string())
    )]
    ConcurrencyConflict {
        /// Kind of the contested aggregate.
        aggregate_type: AggregateType,
        /// Contested aggregate.
        aggregate_id: AggregateId,
        /// What the writer expected.
        expected: ExpectedVersion,
        /// What the store found, when known.
        actual: Option<AggregateVersion>,
    },

    /// A claimed unique value already exists in the tenant. Not retryable.
    #[error("unique constraint {constraint_type} already claims {field}")]
    ConstraintViolation {
        /// Category of the violated constraint.
        constraint_type: ConstraintType,
        /// Value that is already claimed.
        field: ConstraintField,
    },

    /// An append request without events.
    #[error("append request contains no events")]
    NothingToAppend,

    /// An event payload or projection document could not be serialized.
    #[error("serialization failed: {detail}")]
    SerializationFailed {
        /// Serializer message.
        detail: String,
    },

    /// A stored value could not be deserialized.
    #[error("deserialization failed: {detail}")]
    DeserializationFailed {
        /// Deserializer message.
        detail: String,
    },

    /// A stored value violates a domain type's invariants.
    #[error("stored value is invalid: {detail}")]
    InvalidValue {
        /// Which value and why.
        detail: String,
    },

    /// The backing store failed or is unavailable.
    #[error("store operation {operation} failed: {detail}")]
    StoreFailure {
        /// Operation that failed.
        operation: Operation,
        /// Backend message.
        detail: String,
    },
}

impl StoreError {
    /// Returns true if repeating the operation may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::StoreFailure { .. }
        )
    }
}

/// Append-only, per-tenant event log with a unique constraint index.
///
/// Implementations include:
/// - `iamstore-postgres`: PostgreSQL backend, one transaction per append
/// - `iamstore-memory`: in-process backend guarded by a single mutex
pub trait EventLog {
    /// Atomically append events to one aggregate.
    ///
    /// The version check, unique constraint changes, sequence assignment and
    /// event insert commit together or not at all.
    ///
    /// # Returns
    ///
    /// * `Ok(events)` - the committed events with their sequences and versions
    /// * `Err(StoreError::ConcurrencyConflict)` - the expected version did not match
    /// * `Err(StoreError::ConstraintViolation)` - a claimed value already exists
    fn append(
        &self,
        request: AppendRequest,
    ) -> impl Future<Output = Result<Vec<StoredEvent>, StoreError>> + Send;

    /// Read events matching `query`, ascending by sequence.
    fn query(
        &self,
        query: &EventQuery,
    ) -> impl Future<Output = Result<Vec<StoredEvent>, StoreError>> + Send;

    /// Highest sequence matching `query` (the limit is ignored), zero if none.
    fn latest_sequence(
        &self,
        query: &EventQuery,
    ) -> impl Future<Output = Result<Sequence, StoreError>> + Send;

    /// Tenants with at least one event.
    fn tenants(&self) -> impl Future<Output = Result<Vec<TenantId>, StoreError>> + Send;
}

/// Blanket implementation allowing EventLog to work with references.
impl<T: EventLog + Sync> EventLog for &T {
    async fn append(&self, request: AppendRequest) -> Result<Vec<StoredEvent>, StoreError> {
        (*self).append(request).await
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError> {
        (*self).query(query).await
    }

    async fn latest_sequence(&self, query: &EventQuery) -> Result<Sequence, StoreError> {
        (*self).latest_sequence(query).await
    }

    async fn tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        (*self).tenants().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{AggregateId, EditorId, ResourceOwner};
    use chrono::Utc;
    use serde_json::{Value, json};

    struct Renamed {
        name: &'static str,
    }

    impl DomainEvent for Renamed {
        fn event_type(&self) -> EventType {
            EventType::try_new("user.renamed").expect("valid event type")
        }

        fn payload(&self) -> serde_json::Result<Value> {
            Ok(json!({ "name": self.name }))
        }
    }

    fn tenant() -> TenantId {
        TenantId::try_new("tenant-1").expect("valid tenant")
    }

    fn aggregate() -> AggregateRef {
        AggregateRef::new(
            AggregateType::try_new("user").expect("valid aggregate type"),
            AggregateId::try_new("user-1").expect("valid aggregate id"),
            ResourceOwner::try_new("org-1").expect("valid resource owner"),
        )
    }

    fn editor() -> EditorId {
        EditorId::try_new("admin").expect("valid editor")
    }

    fn stored(sequence: u64, event_type: &str) -> StoredEvent {
        StoredEvent {
            tenant: tenant(),
            aggregate_type: aggregate().aggregate_type,
            aggregate_id: aggregate().aggregate_id,
            aggregate_version: AggregateVersion::new(sequence),
            sequence: Sequence::new(sequence),
            event_type: EventType::try_new(event_type).expect("valid event type"),
            payload: json!({}),
            created_at: Utc::now(),
            editor: editor(),
            resource_owner: aggregate().resource_owner,
        }
    }

    #[test]
    fn build_rejects_requests_without_events() {
        let error = AppendRequest::new(tenant(), aggregate(), ExpectedVersion::Any)
            .build()
            .expect_err("empty request should be rejected");

        assert!(matches!(error, StoreError::NothingToAppend));
    }

    #[test]
    fn with_event_serializes_payload_and_type() {
        let request = AppendRequest::new(tenant(), aggregate(), ExpectedVersion::Any)
            .with_event(&editor(), &Renamed { name: "alice" })
            .build()
            .expect("request should build");

        assert_eq!(request.events().len(), 1);
        assert_eq!(request.events()[0].event_type.as_ref(), "user.renamed");
        assert_eq!(request.events()[0].payload, json!({ "name": "alice" }));
    }

    #[test]
    fn constraint_actions_keep_declaration_order() {
        let constraint = UniqueConstraint::new(
            ConstraintType::try_new("login_name").expect("valid type"),
            ConstraintField::try_new("alice").expect("valid field"),
        );

        let request = AppendRequest::new(tenant(), aggregate(), ExpectedVersion::Any)
            .with_event(&editor(), &Renamed { name: "alice" })
            .release_unique(constraint.clone())
            .claim_unique(constraint.clone())
            .build()
            .expect("request should build");

        assert_eq!(
            request.constraints(),
            &[
                UniqueConstraintAction::Release(constraint.clone()),
                UniqueConstraintAction::Claim(constraint),
            ]
        );
    }

    #[test]
    fn expected_version_exact_requires_equal_version() {
        let expected = ExpectedVersion::Exact(AggregateVersion::new(1));
        assert!(expected.is_satisfied_by(AggregateVersion::new(1)));
        assert!(!expected.is_satisfied_by(AggregateVersion::new(2)));
        assert!(ExpectedVersion::Any.is_satisfied_by(AggregateVersion::new(7)));
    }

    #[test]
    fn query_matches_bounds_and_types() {
        let query = EventQuery::tenant(tenant())
            .event_types([EventType::try_new("user.added").expect("valid event type")])
            .after(Sequence::new(2))
            .up_to(Sequence::new(4));

        assert!(!query.matches(&stored(2, "user.added")));
        assert!(query.matches(&stored(3, "user.added")));
        assert!(query.matches(&stored(4, "user.added")));
        assert!(!query.matches(&stored(5, "user.added")));
        assert!(!query.matches(&stored(3, "user.removed")));
    }

    #[test]
    fn query_does_not_match_other_tenants() {
        let query = EventQuery::tenant(TenantId::try_new("tenant-2").expect("valid tenant"));
        assert!(!query.matches(&stored(1, "user.added")));
    }

    #[test]
    fn only_conflicts_and_store_failures_are_retryable() {
        let conflict = StoreError::ConcurrencyConflict {
            aggregate_type: aggregate().aggregate_type,
            aggregate_id: aggregate().aggregate_id,
            expected: ExpectedVersion::Exact(AggregateVersion::initial()),
            actual: Some(AggregateVersion::new(1)),
        };
        let violation = StoreError::ConstraintViolation {
            constraint_type: ConstraintType::try_new("login_name").expect("valid type"),
            field: ConstraintField::try_new("alice").expect("valid field"),
        };
        let failure = StoreError::StoreFailure {
            operation: Operation::Append,
            detail: "connection reset".to_string(),
        };

        assert!(conflict.is_retryable());
        assert!(failure.is_retryable());
        assert!(!violation.is_retryable());
        assert!(!StoreError::NothingToAppend.is_retryable());
    }

    #[test]
    fn conflict_message_names_aggregate_and_versions() {
        let conflict = StoreError::ConcurrencyConflict {
            aggregate_type: aggregate().aggregate_type,
            aggregate_id: aggregate().aggregate_id,
            expected: ExpectedVersion::Exact(AggregateVersion::initial()),
            actual: Some(AggregateVersion::new(1)),
        };

        assert_eq!(
            conflict.to_string(),
            "concurrency conflict on user/user-1: expected version 0, found 1"
        );
    }
}
