//! Behavioral contracts every storage backend must honor.
//!
//! Each scenario is a plain async function taking a store factory, so a
//! backend can also call one directly. The macros at the bottom generate one
//! `#[tokio::test]` per scenario.

use crate::fixtures;
use chrono::Utc;
use futures::future::join_all;
use iamstore_types::{
    AggregateRef, AggregateVersion, AppendRequest, BatchCommit, BatchSize, EventLog, EventQuery,
    ExpectedVersion, FailedEventLedger, HandlerFailure, LockOutcome, PendingStatement,
    ProjectionBatch, ProjectionName, ProjectionStore, Sequence, SequenceTracker, Statement,
    StoreError, StoredEvent, TaskLock, TenantId, UniqueConstraint,
};
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A contract scenario that did not hold.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: &StoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Result of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

fn ensure(scenario: &'static str, condition: bool, detail: impl Into<String>) -> ContractTestResult {
    if condition {
        Ok(())
    } else {
        Err(ContractTestFailure::new(scenario, detail))
    }
}

fn step<T>(
    scenario: &'static str,
    operation: &'static str,
    result: Result<T, StoreError>,
) -> Result<T, ContractTestFailure> {
    result.map_err(|error| ContractTestFailure::store_error(scenario, operation, &error))
}

fn request(
    scenario: &'static str,
    tenant: &TenantId,
    aggregate: &AggregateRef,
    expected: ExpectedVersion,
    tags: &[&str],
    constraints: &[UniqueConstraint],
) -> Result<AppendRequest, ContractTestFailure> {
    let request = tags.iter().fold(
        AppendRequest::new(tenant.clone(), aggregate.clone(), expected),
        |request, tag| request.with_pending_event(fixtures::pending(tag, json!({ "tag": tag }))),
    );
    let request = constraints
        .iter()
        .fold(request, |request, constraint| {
            request.claim_unique(constraint.clone())
        });
    step(scenario, "build", request.build())
}

async fn append<S: EventLog>(
    scenario: &'static str,
    store: &S,
    request: AppendRequest,
) -> Result<Vec<StoredEvent>, ContractTestFailure> {
    step(scenario, "append", store.append(request).await)
}

fn sequences(events: &[StoredEvent]) -> Vec<u64> {
    events.iter().map(|event| event.sequence.into_inner()).collect()
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Appends assign gapless per-tenant sequences and per-aggregate versions.
pub async fn test_append_assigns_positions<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventLog + Send + Sync + 'static,
{
    const SCENARIO: &str = "append_assigns_positions";

    let store = make_store();
    let tenant = fixtures::tenant(SCENARIO);
    let alice = fixtures::user();
    let bob = fixtures::user();

    let first = append(
        SCENARIO,
        &store,
        request(
            SCENARIO,
            &tenant,
            &alice,
            ExpectedVersion::Exact(AggregateVersion::initial()),
            &["user.added", "user.renamed"],
            &[],
        )?,
    )
    .await?;
    let second = append(
        SCENARIO,
        &store,
        request(
            SCENARIO,
            &tenant,
            &bob,
            ExpectedVersion::Exact(AggregateVersion::initial()),
            &["user.added"],
            &[],
        )?,
    )
    .await?;

    ensure(
        SCENARIO,
        sequences(&first) == [1, 2] && sequences(&second) == [3],
        format!(
            "expected sequences [1, 2] and [3], got {:?} and {:?}",
            sequences(&first),
            sequences(&second)
        ),
    )?;
    ensure(
        SCENARIO,
        first.last().map(|event| event.aggregate_version) == Some(AggregateVersion::new(2))
            && second.first().map(|event| event.aggregate_version)
                == Some(AggregateVersion::new(1)),
        "aggregate versions must count per aggregate",
    )?;

    let all = step(
        SCENARIO,
        "query",
        store.query(&EventQuery::tenant(tenant.clone())).await,
    )?;
    ensure(
        SCENARIO,
        sequences(&all) == [1, 2, 3],
        format!("query must return events in sequence order, got {:?}", sequences(&all)),
    )?;
    ensure(
        SCENARIO,
        all.iter()
            .all(|event| event.tenant == tenant && event.editor == fixtures::editor()),
        "stored events must keep tenant and editor",
    )
}

/// A stale expected version is rejected and leaves the log untouched.
pub async fn test_version_conflict<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventLog + Send + Sync + 'static,
{
    const SCENARIO: &str = "version_conflict";

    let store = make_store();
    let tenant = fixtures::tenant(SCENARIO);
    let user = fixtures::user();
    let initial = ExpectedVersion::Exact(AggregateVersion::initial());

    let _ = append(
        SCENARIO,
        &store,
        request(SCENARIO, &tenant, &user, initial, &["user.added"], &[])?,
    )
    .await?;

    match store
        .append(request(SCENARIO, &tenant, &user, initial, &["user.added"], &[])?)
        .await
    {
        Err(StoreError::ConcurrencyConflict { actual, .. }) => ensure(
            SCENARIO,
            actual.is_none_or(|actual| actual == AggregateVersion::new(1)),
            format!("conflict must report the current version, got {actual:?}"),
        )?,
        Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "append", &error)),
        Ok(_) => {
            return Err(ContractTestFailure::new(
                SCENARIO,
                "expected a concurrency conflict but append succeeded",
            ));
        }
    }

    let _ = append(
        SCENARIO,
        &store,
        request(SCENARIO, &tenant, &user, ExpectedVersion::Any, &["user.touched"], &[])?,
    )
    .await?;

    let events = step(
        SCENARIO,
        "query",
        store.query(&EventQuery::tenant(tenant)).await,
    )?;
    ensure(
        SCENARIO,
        sequences(&events) == [1, 2],
        format!("rejected append must not leave events behind, got {:?}", sequences(&events)),
    )
}

/// Of many concurrent appends against the same version, exactly one wins.
pub async fn test_concurrent_appends_single_winner<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventLog + Send + Sync + 'static,
{
    const SCENARIO: &str = "concurrent_appends_single_winner";
    const WRITERS: usize = 8;

    let store = Arc::new(make_store());
    let tenant = fixtures::tenant(SCENARIO);
    let user = fixtures::user();

    let requests = (0..WRITERS)
        .map(|_| {
            request(
                SCENARIO,
                &tenant,
                &user,
                ExpectedVersion::Exact(AggregateVersion::initial()),
                &["user.added"],
                &[],
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let handles = requests.into_iter().map(|request| {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.append(request).await })
    });

    let mut winners = 0;
    for outcome in join_all(handles).await {
        match outcome {
            Ok(Ok(_)) => winners += 1,
            Ok(Err(StoreError::ConcurrencyConflict { .. })) => {}
            Ok(Err(error)) => {
                return Err(ContractTestFailure::store_error(SCENARIO, "append", &error));
            }
            Err(join_error) => {
                return Err(ContractTestFailure::new(
                    SCENARIO,
                    format!("writer task failed: {join_error}"),
                ));
            }
        }
    }

    ensure(
        SCENARIO,
        winners == 1,
        format!("expected exactly one winning append, got {winners}"),
    )?;
    let latest = step(
        SCENARIO,
        "latest_sequence",
        store.latest_sequence(&EventQuery::tenant(tenant)).await,
    )?;
    ensure(
        SCENARIO,
        latest == Sequence::new(1),
        format!("losing appends must not consume sequences, latest is {latest}"),
    )
}

/// Unique constraints are enforced per tenant, atomically with the append.
pub async fn test_unique_constraints<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventLog + Send + Sync + 'static,
{
    const SCENARIO: &str = "unique_constraints";

    let store = make_store();
    let tenant = fixtures::tenant(SCENARIO);
    let other_tenant = fixtures::tenant(SCENARIO);
    let alice = fixtures::user();
    let impostor = fixtures::user();
    let name = fixtures::login_name("alice");
    let initial = ExpectedVersion::Exact(AggregateVersion::initial());

    let _ = append(
        SCENARIO,
        &store,
        request(SCENARIO, &tenant, &alice, initial, &["user.added"], &[name.clone()])?,
    )
    .await?;

    match store
        .append(request(
            SCENARIO,
            &tenant,
            &impostor,
            initial,
            &["user.added"],
            &[name.clone()],
        )?)
        .await
    {
        Err(StoreError::ConstraintViolation {
            constraint_type,
            field,
        }) => ensure(
            SCENARIO,
            constraint_type == name.constraint_type && field == name.field,
            "violation must name the conflicting constraint",
        )?,
        Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "append", &error)),
        Ok(_) => {
            return Err(ContractTestFailure::new(
                SCENARIO,
                "expected a constraint violation but append succeeded",
            ));
        }
    }

    let impostor_events = step(
        SCENARIO,
        "query",
        store
            .query(
                &EventQuery::tenant(tenant.clone())
                    .aggregate_ids([impostor.aggregate_id.clone()]),
            )
            .await,
    )?;
    ensure(
        SCENARIO,
        impostor_events.is_empty(),
        "a violated constraint must reject the whole append",
    )?;

    let _ = append(
        SCENARIO,
        &store,
        request(SCENARIO, &other_tenant, &impostor, initial, &["user.added"], &[name.clone()])?,
    )
    .await?;

    let release = step(
        SCENARIO,
        "build",
        AppendRequest::new(
            tenant.clone(),
            alice.clone(),
            ExpectedVersion::Exact(AggregateVersion::new(1)),
        )
        .with_pending_event(fixtures::pending("user.renamed", json!({ "to": "alicia" })))
        .release_unique(name.clone())
        .claim_unique(fixtures::login_name("alicia"))
        .build(),
    )?;
    let _ = append(SCENARIO, &store, release).await?;

    let _ = append(
        SCENARIO,
        &store,
        request(SCENARIO, &tenant, &impostor, initial, &["user.added"], &[name])?,
    )
    .await?;
    Ok(())
}

/// Releasing all constraints of a tenant frees every claimed value.
pub async fn test_release_tenant_constraints<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventLog + Send + Sync + 'static,
{
    const SCENARIO: &str = "release_tenant_constraints";

    let store = make_store();
    let tenant = fixtures::tenant(SCENARIO);
    let instance = fixtures::aggregate("instance");
    let initial = ExpectedVersion::Exact(AggregateVersion::initial());
    let claimed = [fixtures::login_name("alice"), fixtures::login_name("bob")];

    let _ = append(
        SCENARIO,
        &store,
        request(SCENARIO, &tenant, &instance, initial, &["instance.added"], &claimed)?,
    )
    .await?;

    let removal = step(
        SCENARIO,
        "build",
        AppendRequest::new(tenant.clone(), instance.clone(), ExpectedVersion::Any)
            .with_pending_event(fixtures::pending("instance.removed", Value::Null))
            .release_tenant_constraints()
            .build(),
    )?;
    let _ = append(SCENARIO, &store, removal).await?;

    let _ = append(
        SCENARIO,
        &store,
        request(
            SCENARIO,
            &tenant,
            &fixtures::user(),
            initial,
            &["user.added"],
            &claimed,
        )?,
    )
    .await?;
    Ok(())
}

/// Of many aggregates racing for the same unique value, exactly one gets it.
pub async fn test_concurrent_constraint_claims<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventLog + Send + Sync + 'static,
{
    const SCENARIO: &str = "concurrent_constraint_claims";
    const WRITERS: usize = 8;

    let store = Arc::new(make_store());
    let tenant = fixtures::tenant(SCENARIO);
    let name = fixtures::login_name("contested");

    let requests = (0..WRITERS)
        .map(|_| {
            request(
                SCENARIO,
                &tenant,
                &fixtures::user(),
                ExpectedVersion::Exact(AggregateVersion::initial()),
                &["user.added"],
                std::slice::from_ref(&name),
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let handles = requests.into_iter().map(|request| {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.append(request).await })
    });

    let mut winners = 0;
    for outcome in join_all(handles).await {
        match outcome {
            Ok(Ok(_)) => winners += 1,
            Ok(Err(StoreError::ConstraintViolation { .. })) => {}
            Ok(Err(error)) => {
                return Err(ContractTestFailure::store_error(SCENARIO, "append", &error));
            }
            Err(join_error) => {
                return Err(ContractTestFailure::new(
                    SCENARIO,
                    format!("writer task failed: {join_error}"),
                ));
            }
        }
    }

    ensure(
        SCENARIO,
        winners == 1,
        format!("expected exactly one claim to win, got {winners}"),
    )
}

/// Query filters, bounds and limits; latest sequence honors filters.
pub async fn test_query_filters_and_bounds<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventLog + Send + Sync + 'static,
{
    const SCENARIO: &str = "query_filters_and_bounds";

    let store = make_store();
    let tenant = fixtures::tenant(SCENARIO);
    let user = fixtures::user();
    let org = fixtures::aggregate("org");

    let _ = append(
        SCENARIO,
        &store,
        request(SCENARIO, &tenant, &user, ExpectedVersion::Any, &["user.added"], &[])?,
    )
    .await?;
    let _ = append(
        SCENARIO,
        &store,
        request(SCENARIO, &tenant, &org, ExpectedVersion::Any, &["org.added"], &[])?,
    )
    .await?;
    let _ = append(
        SCENARIO,
        &store,
        request(
            SCENARIO,
            &tenant,
            &user,
            ExpectedVersion::Any,
            &["user.renamed", "user.locked"],
            &[],
        )?,
    )
    .await?;

    let everything = EventQuery::tenant(tenant.clone());
    let users = everything
        .clone()
        .aggregate_types([user.aggregate_type.clone()]);

    let user_events = step(SCENARIO, "query", store.query(&users).await)?;
    ensure(
        SCENARIO,
        sequences(&user_events) == [1, 3, 4],
        format!("aggregate type filter, got {:?}", sequences(&user_events)),
    )?;

    let renamed = step(
        SCENARIO,
        "query",
        store
            .query(&everything.clone().event_types([fixtures::event_type("user.renamed")]))
            .await,
    )?;
    ensure(
        SCENARIO,
        sequences(&renamed) == [3],
        format!("event type filter, got {:?}", sequences(&renamed)),
    )?;

    let window = step(
        SCENARIO,
        "query",
        store
            .query(
                &everything
                    .clone()
                    .after(Sequence::new(1))
                    .up_to(Sequence::new(3)),
            )
            .await,
    )?;
    ensure(
        SCENARIO,
        sequences(&window) == [2, 3],
        format!("after is exclusive and up_to inclusive, got {:?}", sequences(&window)),
    )?;

    let page = step(
        SCENARIO,
        "query",
        store
            .query(&everything.clone().after(Sequence::new(1)).limit(BatchSize::new(2)))
            .await,
    )?;
    ensure(
        SCENARIO,
        sequences(&page) == [2, 3],
        format!("limit must cut the page, got {:?}", sequences(&page)),
    )?;

    let latest_user = step(SCENARIO, "latest_sequence", store.latest_sequence(&users).await)?;
    let latest_org = step(
        SCENARIO,
        "latest_sequence",
        store
            .latest_sequence(&everything.clone().aggregate_ids([org.aggregate_id.clone()]))
            .await,
    )?;
    ensure(
        SCENARIO,
        latest_user == Sequence::new(4) && latest_org == Sequence::new(2),
        format!("latest sequence must honor filters, got {latest_user} and {latest_org}"),
    )?;

    let untouched = fixtures::tenant(SCENARIO);
    let empty = step(
        SCENARIO,
        "query",
        store.query(&EventQuery::tenant(untouched.clone())).await,
    )?;
    let zero = step(
        SCENARIO,
        "latest_sequence",
        store.latest_sequence(&EventQuery::tenant(untouched)).await,
    )?;
    ensure(
        SCENARIO,
        empty.is_empty() && zero == Sequence::zero(),
        "an unknown tenant reads as empty",
    )
}

/// Tenants are isolated and discoverable once they have events.
pub async fn test_tenant_isolation<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventLog + Send + Sync + 'static,
{
    const SCENARIO: &str = "tenant_isolation";

    let store = make_store();
    let left = fixtures::tenant(SCENARIO);
    let right = fixtures::tenant(SCENARIO);

    let _ = append(
        SCENARIO,
        &store,
        request(SCENARIO, &left, &fixtures::user(), ExpectedVersion::Any, &["user.added"], &[])?,
    )
    .await?;
    let right_events = append(
        SCENARIO,
        &store,
        request(SCENARIO, &right, &fixtures::user(), ExpectedVersion::Any, &["user.added"], &[])?,
    )
    .await?;

    ensure(
        SCENARIO,
        sequences(&right_events) == [1],
        "each tenant numbers its own sequence from 1",
    )?;

    let left_events = step(
        SCENARIO,
        "query",
        store.query(&EventQuery::tenant(left.clone())).await,
    )?;
    ensure(
        SCENARIO,
        left_events.len() == 1 && left_events.iter().all(|event| event.tenant == left),
        "a tenant must only see its own events",
    )?;

    let tenants = step(SCENARIO, "tenants", store.tenants().await)?;
    ensure(
        SCENARIO,
        tenants.contains(&left) && tenants.contains(&right),
        "tenants with events must be listed",
    )
}

// ---------------------------------------------------------------------------
// Projection storage
// ---------------------------------------------------------------------------

fn statement(sequence: u64, statement: Statement) -> PendingStatement {
    PendingStatement {
        sequence: Sequence::new(sequence),
        created_at: Utc::now(),
        statement,
    }
}

fn upsert(sequence: u64, entity: &str, data: Value) -> PendingStatement {
    statement(
        sequence,
        Statement::Upsert {
            entity_id: fixtures::entity(entity),
            data,
        },
    )
}

fn batch(
    projection: &ProjectionName,
    tenant: &TenantId,
    statements: Vec<PendingStatement>,
    advance_to: Option<u64>,
) -> ProjectionBatch {
    let mut batch = ProjectionBatch::new(projection.clone(), tenant.clone(), Utc::now());
    batch.statements = statements;
    batch.advance_to = advance_to.map(Sequence::new);
    batch
}

async fn row_data<S: ProjectionStore>(
    scenario: &'static str,
    store: &S,
    projection: &ProjectionName,
    tenant: &TenantId,
    entity: &str,
) -> Result<Option<Value>, ContractTestFailure> {
    let row = step(
        scenario,
        "row",
        store
            .row(projection, tenant, &fixtures::entity(entity))
            .await,
    )?;
    Ok(row.map(|row| row.data))
}

/// A committed batch writes rows and advances the current sequence together.
pub async fn test_commit_applies_and_advances<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: ProjectionStore + SequenceTracker + Send + Sync + 'static,
{
    const SCENARIO: &str = "commit_applies_and_advances";

    let store = make_store();
    let projection = fixtures::projection("users");
    let tenant = fixtures::tenant(SCENARIO);

    let commit = step(
        SCENARIO,
        "commit_batch",
        store
            .commit_batch(batch(
                &projection,
                &tenant,
                vec![
                    upsert(1, "alice", json!({ "name": "alice" })),
                    upsert(2, "bob", json!({ "name": "bob" })),
                ],
                Some(3),
            ))
            .await,
    )?;
    ensure(SCENARIO, commit == BatchCommit::Applied, format!("got {commit:?}"))?;

    let rows = step(SCENARIO, "rows", store.rows(&projection, &tenant).await)?;
    ensure(
        SCENARIO,
        rows.len() == 2,
        format!("expected two rows, got {}", rows.len()),
    )?;
    let bob = step(
        SCENARIO,
        "row",
        store
            .row(&projection, &tenant, &fixtures::entity("bob"))
            .await,
    )?;
    ensure(
        SCENARIO,
        bob.as_ref().map(|row| (row.sequence, &row.data))
            == Some((Sequence::new(2), &json!({ "name": "bob" }))),
        format!("row must carry its data and sequence, got {bob:?}"),
    )?;

    let current = step(
        SCENARIO,
        "current_sequence",
        store.current_sequence(&projection, &tenant).await,
    )?;
    ensure(
        SCENARIO,
        current == Sequence::new(3),
        format!("current sequence must advance to 3, got {current}"),
    )?;

    let other_tenant = fixtures::tenant(SCENARIO);
    let foreign = step(SCENARIO, "rows", store.rows(&projection, &other_tenant).await)?;
    ensure(SCENARIO, foreign.is_empty(), "rows are scoped to a tenant")
}

/// A batch whose target was already reached changes nothing.
pub async fn test_stale_batch_is_rejected<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: ProjectionStore + SequenceTracker + Send + Sync + 'static,
{
    const SCENARIO: &str = "stale_batch_is_rejected";

    let store = make_store();
    let projection = fixtures::projection("users");
    let tenant = fixtures::tenant(SCENARIO);

    let _ = step(
        SCENARIO,
        "commit_batch",
        store
            .commit_batch(batch(
                &projection,
                &tenant,
                vec![upsert(3, "alice", json!({ "name": "new" }))],
                Some(3),
            ))
            .await,
    )?;

    let stale = step(
        SCENARIO,
        "commit_batch",
        store
            .commit_batch(batch(
                &projection,
                &tenant,
                vec![upsert(2, "alice", json!({ "name": "old" }))],
                Some(2),
            ))
            .await,
    )?;
    ensure(
        SCENARIO,
        stale == BatchCommit::Stale {
            current: Sequence::new(3),
        },
        format!("expected a stale commit at 3, got {stale:?}"),
    )?;

    let data = row_data(SCENARIO, &store, &projection, &tenant, "alice").await?;
    ensure(
        SCENARIO,
        data == Some(json!({ "name": "new" })),
        format!("stale batch must not touch rows, got {data:?}"),
    )
}

/// Of two identical batches committed concurrently, one applies.
pub async fn test_concurrent_batches_commit_once<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: ProjectionStore + SequenceTracker + Send + Sync + 'static,
{
    const SCENARIO: &str = "concurrent_batches_commit_once";
    const WORKERS: usize = 4;

    let store = Arc::new(make_store());
    let projection = fixtures::projection("users");
    let tenant = fixtures::tenant(SCENARIO);

    let handles = (0..WORKERS).map(|_| {
        let store = Arc::clone(&store);
        let batch = batch(
            &projection,
            &tenant,
            vec![upsert(1, "alice", json!({ "name": "alice" }))],
            Some(1),
        );
        tokio::spawn(async move { store.commit_batch(batch).await })
    });

    let mut applied = 0;
    for outcome in join_all(handles).await {
        match outcome {
            Ok(Ok(BatchCommit::Applied)) => applied += 1,
            Ok(Ok(BatchCommit::Stale { .. })) => {}
            Ok(Err(error)) => {
                return Err(ContractTestFailure::store_error(SCENARIO, "commit_batch", &error));
            }
            Err(join_error) => {
                return Err(ContractTestFailure::new(
                    SCENARIO,
                    format!("worker task failed: {join_error}"),
                ));
            }
        }
    }

    ensure(
        SCENARIO,
        applied == 1,
        format!("expected exactly one applied batch, got {applied}"),
    )
}

/// Rows never regress to an older event; re-applying the same event is a no-op.
pub async fn test_row_sequence_guard<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: ProjectionStore + SequenceTracker + Send + Sync + 'static,
{
    const SCENARIO: &str = "row_sequence_guard";

    let store = make_store();
    let projection = fixtures::projection("users");
    let tenant = fixtures::tenant(SCENARIO);

    let _ = step(
        SCENARIO,
        "commit_batch",
        store
            .commit_batch(batch(
                &projection,
                &tenant,
                vec![
                    upsert(1, "alice", json!({ "name": "alice" })),
                    upsert(5, "alice", json!({ "name": "alicia" })),
                ],
                Some(5),
            ))
            .await,
    )?;

    // A retried event (no advance) must not overwrite newer state.
    let retried = step(
        SCENARIO,
        "commit_batch",
        store
            .commit_batch(batch(
                &projection,
                &tenant,
                vec![
                    upsert(2, "alice", json!({ "name": "stale" })),
                    statement(
                        3,
                        Statement::Delete {
                            entity_id: fixtures::entity("alice"),
                        },
                    ),
                ],
                None,
            ))
            .await,
    )?;
    ensure(SCENARIO, retried == BatchCommit::Applied, format!("got {retried:?}"))?;

    let data = row_data(SCENARIO, &store, &projection, &tenant, "alice").await?;
    ensure(
        SCENARIO,
        data == Some(json!({ "name": "alicia" })),
        format!("older events must not regress a row, got {data:?}"),
    )?;

    let _ = step(
        SCENARIO,
        "commit_batch",
        store
            .commit_batch(batch(
                &projection,
                &tenant,
                vec![upsert(5, "alice", json!({ "name": "alicia" }))],
                None,
            ))
            .await,
    )?;
    let row = step(
        SCENARIO,
        "row",
        store
            .row(&projection, &tenant, &fixtures::entity("alice"))
            .await,
    )?;
    ensure(
        SCENARIO,
        row.map(|row| (row.sequence, row.data))
            == Some((Sequence::new(5), json!({ "name": "alicia" }))),
        "re-applying the same event must be idempotent",
    )
}

/// Merge updates fields of existing rows only; deletes remove rows.
pub async fn test_merge_and_delete<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: ProjectionStore + SequenceTracker + Send + Sync + 'static,
{
    const SCENARIO: &str = "merge_and_delete";

    let store = make_store();
    let projection = fixtures::projection("users");
    let tenant = fixtures::tenant(SCENARIO);

    let mut locked = Map::new();
    let _ = locked.insert("state".to_string(), json!("locked"));

    let _ = step(
        SCENARIO,
        "commit_batch",
        store
            .commit_batch(batch(
                &projection,
                &tenant,
                vec![
                    upsert(1, "alice", json!({ "name": "alice", "state": "active" })),
                    upsert(2, "bob", json!({ "name": "bob", "state": "active" })),
                    upsert(3, "carol", json!({ "name": "carol", "state": "active" })),
                    statement(
                        4,
                        Statement::Merge {
                            entity_id: fixtures::entity("alice"),
                            fields: locked.clone(),
                        },
                    ),
                    statement(
                        5,
                        Statement::Merge {
                            entity_id: fixtures::entity("nobody"),
                            fields: locked,
                        },
                    ),
                    statement(
                        6,
                        Statement::Delete {
                            entity_id: fixtures::entity("bob"),
                        },
                    ),
                ],
                Some(6),
            ))
            .await,
    )?;

    let alice = row_data(SCENARIO, &store, &projection, &tenant, "alice").await?;
    ensure(
        SCENARIO,
        alice == Some(json!({ "name": "alice", "state": "locked" })),
        format!("merge must set fields and keep the rest, got {alice:?}"),
    )?;
    let nobody = row_data(SCENARIO, &store, &projection, &tenant, "nobody").await?;
    ensure(SCENARIO, nobody.is_none(), "merge must not create rows")?;
    let bob = row_data(SCENARIO, &store, &projection, &tenant, "bob").await?;
    ensure(SCENARIO, bob.is_none(), "delete must remove the row")?;

    let _ = step(
        SCENARIO,
        "commit_batch",
        store
            .commit_batch(batch(
                &projection,
                &tenant,
                vec![statement(7, Statement::DeleteAll)],
                Some(7),
            ))
            .await,
    )?;
    let rows = step(SCENARIO, "rows", store.rows(&projection, &tenant).await)?;
    ensure(SCENARIO, rows.is_empty(), "delete all must clear the tenant's rows")
}

/// Failures are counted per event, resolved entries disappear, and operators
/// can remove or reset entries.
pub async fn test_failed_event_ledger<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: ProjectionStore + SequenceTracker + FailedEventLedger + Send + Sync + 'static,
{
    const SCENARIO: &str = "failed_event_ledger";

    let store = make_store();
    let projection = fixtures::projection("users");
    let tenant = fixtures::tenant(SCENARIO);

    let failing = |sequences: &[u64], advance_to: Option<u64>| {
        let mut batch = batch(&projection, &tenant, Vec::new(), advance_to);
        batch.failures = sequences
            .iter()
            .map(|sequence| HandlerFailure {
                sequence: Sequence::new(*sequence),
                error_message: format!("cannot reduce {sequence}"),
            })
            .collect();
        batch
    };

    let _ = step(
        SCENARIO,
        "commit_batch",
        store.commit_batch(failing(&[2, 4], Some(5))).await,
    )?;
    let _ = step(
        SCENARIO,
        "commit_batch",
        store.commit_batch(failing(&[2], None)).await,
    )?;

    let entries = step(
        SCENARIO,
        "failed_events",
        store.failed_events(Some(&projection), Some(&tenant)).await,
    )?;
    let counts: Vec<(u64, u32)> = entries
        .iter()
        .map(|entry| (entry.failed_sequence.into_inner(), entry.failure_count))
        .collect();
    ensure(
        SCENARIO,
        counts == [(2, 2), (4, 1)],
        format!("failures must be counted per event, got {counts:?}"),
    )?;
    ensure(
        SCENARIO,
        entries
            .iter()
            .all(|entry| entry.error_message.starts_with("cannot reduce")),
        "entries must keep the last error message",
    )?;

    let mut resolving = batch(&projection, &tenant, Vec::new(), None);
    resolving.resolved = vec![Sequence::new(4)];
    let _ = step(SCENARIO, "commit_batch", store.commit_batch(resolving).await)?;

    let reset = step(
        SCENARIO,
        "reset_failure_count",
        store
            .reset_failure_count(&projection, &tenant, Sequence::new(2))
            .await,
    )?;
    let entries = step(
        SCENARIO,
        "failed_events",
        store.failed_events(Some(&projection), None).await,
    )?;
    ensure(
        SCENARIO,
        reset
            && entries.len() == 1
            && entries
                .first()
                .is_some_and(|entry| entry.failure_count == 0),
        format!("resolved entries must disappear and reset must zero the count, got {entries:?}"),
    )?;

    let removed = step(
        SCENARIO,
        "remove_failed_event",
        store
            .remove_failed_event(&projection, &tenant, Sequence::new(2))
            .await,
    )?;
    let removed_again = step(
        SCENARIO,
        "remove_failed_event",
        store
            .remove_failed_event(&projection, &tenant, Sequence::new(2))
            .await,
    )?;
    ensure(
        SCENARIO,
        removed && !removed_again,
        "remove must report whether an entry existed",
    )
}

/// A batch overlapping a range another runner committed only applies and
/// records the events past the stored sequence.
pub async fn test_overlapping_batches_record_failures_once<F, S>(
    make_store: F,
) -> ContractTestResult
where
    F: Fn() -> S,
    S: ProjectionStore + SequenceTracker + FailedEventLedger + Send + Sync + 'static,
{
    const SCENARIO: &str = "overlapping_batches_record_failures_once";

    let store = make_store();
    let projection = fixtures::projection("users");
    let tenant = fixtures::tenant(SCENARIO);
    let failure = |sequence: u64| HandlerFailure {
        sequence: Sequence::new(sequence),
        error_message: format!("cannot reduce {sequence}"),
    };

    // One runner commits events 1..=2 with a batch size of two.
    let mut short = batch(
        &projection,
        &tenant,
        vec![upsert(1, "alice", json!({ "name": "alice" }))],
        Some(2),
    );
    short.failures = vec![failure(2)];
    let _ = step(SCENARIO, "commit_batch", store.commit_batch(short).await)?;

    // Another runner started from the same position with a batch size of four.
    let mut long = batch(
        &projection,
        &tenant,
        vec![
            upsert(1, "alice", json!({ "name": "overlap" })),
            upsert(3, "bob", json!({ "name": "bob" })),
        ],
        Some(4),
    );
    long.failures = vec![failure(2), failure(4)];
    let commit = step(SCENARIO, "commit_batch", store.commit_batch(long).await)?;
    ensure(SCENARIO, commit == BatchCommit::Applied, format!("got {commit:?}"))?;

    let entries = step(
        SCENARIO,
        "failed_events",
        store.failed_events(Some(&projection), Some(&tenant)).await,
    )?;
    let counts: Vec<(u64, u32)> = entries
        .iter()
        .map(|entry| (entry.failed_sequence.into_inner(), entry.failure_count))
        .collect();
    ensure(
        SCENARIO,
        counts == [(2, 1), (4, 1)],
        format!("each failing event must be counted once per pass, got {counts:?}"),
    )?;

    let alice = row_data(SCENARIO, &store, &projection, &tenant, "alice").await?;
    let bob = row_data(SCENARIO, &store, &projection, &tenant, "bob").await?;
    ensure(
        SCENARIO,
        alice == Some(json!({ "name": "alice" })) && bob == Some(json!({ "name": "bob" })),
        format!("only events past the stored sequence may apply, got {alice:?} and {bob:?}"),
    )?;

    let current = step(
        SCENARIO,
        "current_sequence",
        store.current_sequence(&projection, &tenant).await,
    )?;
    ensure(
        SCENARIO,
        current == Sequence::new(4),
        format!("current sequence must advance to 4, got {current}"),
    )
}

/// A ledger replay computed against an outdated position changes nothing;
/// one computed against the stored position applies.
pub async fn test_outdated_replay_is_rejected<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: ProjectionStore + SequenceTracker + FailedEventLedger + Send + Sync + 'static,
{
    const SCENARIO: &str = "outdated_replay_is_rejected";

    let store = make_store();
    let projection = fixtures::projection("users");
    let tenant = fixtures::tenant(SCENARIO);

    let mut first = batch(
        &projection,
        &tenant,
        vec![upsert(3, "alice", json!({ "name": "alicia" }))],
        Some(3),
    );
    first.failures = vec![HandlerFailure {
        sequence: Sequence::new(2),
        error_message: "broken".to_string(),
    }];
    let _ = step(SCENARIO, "commit_batch", store.commit_batch(first).await)?;

    let replay = |through: u64, name: &str| {
        let mut replay = batch(
            &projection,
            &tenant,
            vec![upsert(through, "alice", json!({ "name": name }))],
            None,
        );
        replay.resolved = vec![Sequence::new(2)];
        replay.replayed_through = Some(Sequence::new(through));
        replay
    };

    let outdated = step(
        SCENARIO,
        "commit_batch",
        store.commit_batch(replay(2, "outdated")).await,
    )?;
    ensure(
        SCENARIO,
        outdated
            == BatchCommit::Stale {
                current: Sequence::new(3),
            },
        format!("expected a stale replay at 3, got {outdated:?}"),
    )?;
    let pending = step(
        SCENARIO,
        "failed_events",
        store.failed_events(Some(&projection), Some(&tenant)).await,
    )?;
    let data = row_data(SCENARIO, &store, &projection, &tenant, "alice").await?;
    ensure(
        SCENARIO,
        pending.len() == 1 && data == Some(json!({ "name": "alicia" })),
        format!("a stale replay must not touch rows or the ledger, got {pending:?} and {data:?}"),
    )?;

    let current = step(
        SCENARIO,
        "commit_batch",
        store.commit_batch(replay(3, "replayed")).await,
    )?;
    ensure(SCENARIO, current == BatchCommit::Applied, format!("got {current:?}"))?;
    let pending = step(
        SCENARIO,
        "failed_events",
        store.failed_events(Some(&projection), Some(&tenant)).await,
    )?;
    let data = row_data(SCENARIO, &store, &projection, &tenant, "alice").await?;
    ensure(
        SCENARIO,
        pending.is_empty() && data == Some(json!({ "name": "replayed" })),
        format!("a current replay must apply and resolve, got {pending:?} and {data:?}"),
    )
}

/// The current sequence never moves backwards.
pub async fn test_advance_is_monotonic<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: SequenceTracker + Send + Sync + 'static,
{
    const SCENARIO: &str = "advance_is_monotonic";

    let store = make_store();
    let projection = fixtures::projection("users");
    let other_projection = fixtures::projection("orgs");
    let tenant = fixtures::tenant(SCENARIO);

    let initial = step(
        SCENARIO,
        "current_sequence",
        store.current_sequence(&projection, &tenant).await,
    )?;
    ensure(SCENARIO, initial == Sequence::zero(), "unknown projections start at zero")?;

    for sequence in [5, 3, 7, 6] {
        step(
            SCENARIO,
            "advance",
            store
                .advance(&projection, &tenant, Sequence::new(sequence), Utc::now())
                .await,
        )?;
    }
    step(
        SCENARIO,
        "advance",
        store
            .advance(&other_projection, &tenant, Sequence::new(1), Utc::now())
            .await,
    )?;

    let current = step(
        SCENARIO,
        "current_sequence",
        store.current_sequence(&projection, &tenant).await,
    )?;
    ensure(
        SCENARIO,
        current == Sequence::new(7),
        format!("expected the highest advance, got {current}"),
    )?;

    let listed = step(
        SCENARIO,
        "current_sequences",
        store.current_sequences(Some(&projection)).await,
    )?;
    ensure(
        SCENARIO,
        listed.len() == 1
            && listed
                .iter()
                .all(|entry| entry.projection == projection && entry.sequence == current),
        format!("listing must filter by projection, got {listed:?}"),
    )
}

/// Reset drops rows, positions and failures of one projection only.
pub async fn test_reset_is_scoped<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: ProjectionStore + SequenceTracker + FailedEventLedger + Send + Sync + 'static,
{
    const SCENARIO: &str = "reset_is_scoped";

    let store = make_store();
    let doomed = fixtures::projection("users");
    let kept = fixtures::projection("orgs");
    let tenant = fixtures::tenant(SCENARIO);

    for projection in [&doomed, &kept] {
        let mut commit = batch(
            projection,
            &tenant,
            vec![upsert(1, "alice", json!({}))],
            Some(2),
        );
        commit.failures = vec![HandlerFailure {
            sequence: Sequence::new(2),
            error_message: "broken".to_string(),
        }];
        let _ = step(SCENARIO, "commit_batch", store.commit_batch(commit).await)?;
    }

    step(SCENARIO, "reset", store.reset(&doomed).await)?;

    let doomed_rows = step(SCENARIO, "rows", store.rows(&doomed, &tenant).await)?;
    let doomed_position = step(
        SCENARIO,
        "current_sequence",
        store.current_sequence(&doomed, &tenant).await,
    )?;
    let doomed_failures = step(
        SCENARIO,
        "failed_events",
        store.failed_events(Some(&doomed), None).await,
    )?;
    ensure(
        SCENARIO,
        doomed_rows.is_empty() && doomed_position == Sequence::zero() && doomed_failures.is_empty(),
        "reset must drop rows, position and failures",
    )?;

    let kept_rows = step(SCENARIO, "rows", store.rows(&kept, &tenant).await)?;
    let kept_position = step(
        SCENARIO,
        "current_sequence",
        store.current_sequence(&kept, &tenant).await,
    )?;
    let kept_failures = step(
        SCENARIO,
        "failed_events",
        store.failed_events(Some(&kept), None).await,
    )?;
    ensure(
        SCENARIO,
        kept_rows.len() == 1 && kept_position == Sequence::new(2) && kept_failures.len() == 1,
        "reset must not touch other projections",
    )
}

// ---------------------------------------------------------------------------
// Task lock
// ---------------------------------------------------------------------------

const LEASE: Duration = Duration::from_secs(30);

/// While a lease is live, only its owner is granted the lock.
pub async fn test_lock_is_exclusive<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: TaskLock + Send + Sync + 'static,
{
    const SCENARIO: &str = "lock_is_exclusive";

    let store = make_store();
    let key = fixtures::lock_key("signing_key");
    let first = fixtures::owner();
    let second = fixtures::owner();

    let granted = step(SCENARIO, "try_acquire", store.try_acquire(&key, &first, LEASE).await)?;
    let LockOutcome::Granted(lease) = granted else {
        return Err(ContractTestFailure::new(
            SCENARIO,
            format!("an idle lock must be granted, got {granted:?}"),
        ));
    };
    ensure(
        SCENARIO,
        lease.key == key && lease.owner == first && lease.expires_at > Utc::now(),
        format!("lease must describe the grant, got {lease:?}"),
    )?;

    let denied = step(SCENARIO, "try_acquire", store.try_acquire(&key, &second, LEASE).await)?;
    ensure(
        SCENARIO,
        denied
            == LockOutcome::Denied {
                holder: Some(first.clone()),
            },
        format!("a held lock must be denied naming the holder, got {denied:?}"),
    )?;

    let renewed = step(SCENARIO, "try_acquire", store.try_acquire(&key, &first, LEASE).await)?;
    ensure(
        SCENARIO,
        matches!(&renewed, LockOutcome::Granted(renewal) if renewal.expires_at >= lease.expires_at),
        format!("the holder must be able to renew, got {renewed:?}"),
    )?;

    let other_key = fixtures::lock_key("signing_key");
    let independent = step(
        SCENARIO,
        "try_acquire",
        store.try_acquire(&other_key, &second, LEASE).await,
    )?;
    ensure(
        SCENARIO,
        independent.is_granted(),
        "locks on different keys are independent",
    )
}

/// Only the holder can release; a released lock is free again.
pub async fn test_release_only_by_owner<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: TaskLock + Send + Sync + 'static,
{
    const SCENARIO: &str = "release_only_by_owner";

    let store = make_store();
    let key = fixtures::lock_key("certificate");
    let holder = fixtures::owner();
    let intruder = fixtures::owner();

    let _ = step(SCENARIO, "try_acquire", store.try_acquire(&key, &holder, LEASE).await)?;

    let foreign = step(SCENARIO, "release", store.release(&key, &intruder).await)?;
    ensure(SCENARIO, !foreign, "a non-holder must not release the lock")?;

    let own = step(SCENARIO, "release", store.release(&key, &holder).await)?;
    let twice = step(SCENARIO, "release", store.release(&key, &holder).await)?;
    ensure(
        SCENARIO,
        own && !twice,
        "release must report whether a lease was dropped",
    )?;

    let taken = step(SCENARIO, "try_acquire", store.try_acquire(&key, &intruder, LEASE).await)?;
    ensure(SCENARIO, taken.is_granted(), "a released lock must be free")
}

/// An expired lease no longer blocks other owners.
pub async fn test_expired_lease_is_taken_over<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: TaskLock + Send + Sync + 'static,
{
    const SCENARIO: &str = "expired_lease_is_taken_over";

    let store = make_store();
    let key = fixtures::lock_key("rotation");
    let crashed = fixtures::owner();
    let successor = fixtures::owner();

    let _ = step(
        SCENARIO,
        "try_acquire",
        store
            .try_acquire(&key, &crashed, Duration::from_millis(100))
            .await,
    )?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let taken = step(SCENARIO, "try_acquire", store.try_acquire(&key, &successor, LEASE).await)?;
    ensure(
        SCENARIO,
        taken.is_granted(),
        format!("an expired lease must be taken over, got {taken:?}"),
    )?;

    let late_release = step(SCENARIO, "release", store.release(&key, &crashed).await)?;
    ensure(
        SCENARIO,
        !late_release,
        "the former holder must not release its successor's lease",
    )
}

/// Of many owners racing for an idle lock, exactly one is granted.
pub async fn test_concurrent_acquire_single_winner<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: TaskLock + Send + Sync + 'static,
{
    const SCENARIO: &str = "concurrent_acquire_single_winner";
    const CONTENDERS: usize = 8;

    let store = Arc::new(make_store());
    let key = fixtures::lock_key("singleton");

    let handles = (0..CONTENDERS).map(|_| {
        let store = Arc::clone(&store);
        let key = key.clone();
        tokio::spawn(async move { store.try_acquire(&key, &fixtures::owner(), LEASE).await })
    });

    let mut granted = 0;
    for outcome in join_all(handles).await {
        match outcome {
            Ok(Ok(outcome)) if outcome.is_granted() => granted += 1,
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                return Err(ContractTestFailure::store_error(SCENARIO, "try_acquire", &error));
            }
            Err(join_error) => {
                return Err(ContractTestFailure::new(
                    SCENARIO,
                    format!("contender task failed: {join_error}"),
                ));
            }
        }
    }

    ensure(
        SCENARIO,
        granted == 1,
        format!("expected exactly one grant, got {granted}"),
    )
}

/// Generates the event log contract suite for a backend.
///
/// Pass `ignore = "reason"` to mark every generated test `#[ignore]`, e.g. for
/// backends that need external services.
///
/// ```ignore
/// log_contract_tests! {
///     suite = in_memory,
///     make_store = iamstore_memory::InMemoryStore::new,
/// }
/// ```
#[macro_export]
macro_rules! log_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(, ignore = $reason:literal)? $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_append_assigns_positions, test_concurrent_appends_single_winner,
                test_concurrent_constraint_claims, test_query_filters_and_bounds,
                test_release_tenant_constraints, test_tenant_isolation, test_unique_constraints,
                test_version_conflict,
            };

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn append_assigns_positions_contract() {
                test_append_assigns_positions($make_store)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn version_conflict_contract() {
                test_version_conflict($make_store)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn concurrent_appends_single_winner_contract() {
                test_concurrent_appends_single_winner($make_store)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn unique_constraints_contract() {
                test_unique_constraints($make_store)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn release_tenant_constraints_contract() {
                test_release_tenant_constraints($make_store)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn concurrent_constraint_claims_contract() {
                test_concurrent_constraint_claims($make_store)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn query_filters_and_bounds_contract() {
                test_query_filters_and_bounds($make_store)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn tenant_isolation_contract() {
                test_tenant_isolation($make_store)
                    .await
                    .expect("event log contract failed");
            }
        }
    };
}

pub use log_contract_tests;

/// Generates the projection storage contract suite for a backend.
#[macro_export]
macro_rules! projection_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(, ignore = $reason:literal)? $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_advance_is_monotonic, test_commit_applies_and_advances,
                test_concurrent_batches_commit_once, test_failed_event_ledger,
                test_merge_and_delete, test_outdated_replay_is_rejected,
                test_overlapping_batches_record_failures_once, test_reset_is_scoped,
                test_row_sequence_guard, test_stale_batch_is_rejected,
            };

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn commit_applies_and_advances_contract() {
                test_commit_applies_and_advances($make_store)
                    .await
                    .expect("projection contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn stale_batch_is_rejected_contract() {
                test_stale_batch_is_rejected($make_store)
                    .await
                    .expect("projection contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn concurrent_batches_commit_once_contract() {
                test_concurrent_batches_commit_once($make_store)
                    .await
                    .expect("projection contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn row_sequence_guard_contract() {
                test_row_sequence_guard($make_store)
                    .await
                    .expect("projection contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn merge_and_delete_contract() {
                test_merge_and_delete($make_store)
                    .await
                    .expect("projection contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn failed_event_ledger_contract() {
                test_failed_event_ledger($make_store)
                    .await
                    .expect("projection contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn overlapping_batches_record_failures_once_contract() {
                test_overlapping_batches_record_failures_once($make_store)
                    .await
                    .expect("projection contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn outdated_replay_is_rejected_contract() {
                test_outdated_replay_is_rejected($make_store)
                    .await
                    .expect("projection contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn advance_is_monotonic_contract() {
                test_advance_is_monotonic($make_store)
                    .await
                    .expect("projection contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn reset_is_scoped_contract() {
                test_reset_is_scoped($make_store)
                    .await
                    .expect("projection contract failed");
            }
        }
    };
}

pub use projection_contract_tests;

/// Generates the task lock contract suite for a backend.
#[macro_export]
macro_rules! lock_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(, ignore = $reason:literal)? $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_concurrent_acquire_single_winner, test_expired_lease_is_taken_over,
                test_lock_is_exclusive, test_release_only_by_owner,
            };

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn lock_is_exclusive_contract() {
                test_lock_is_exclusive($make_store)
                    .await
                    .expect("task lock contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn release_only_by_owner_contract() {
                test_release_only_by_owner($make_store)
                    .await
                    .expect("task lock contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn expired_lease_is_taken_over_contract() {
                test_expired_lease_is_taken_over($make_store)
                    .await
                    .expect("task lock contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[ignore = $reason])?
            async fn concurrent_acquire_single_winner_contract() {
                test_concurrent_acquire_single_winner($make_store)
                    .await
                    .expect("task lock contract failed");
            }
        }
    };
}

pub use lock_contract_tests;
