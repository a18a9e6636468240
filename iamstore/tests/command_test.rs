//! Optimistic-concurrency command execution.
//!
//! Scenario: two writers race on the same user
//! - Given a user loaded by two service instances
//! - When both append a change against the version they read
//! - Then one wins, the other reloads and applies its change on top

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::{UserAdded, UserError, UserEvent, add_user, policy, user_type};
use iamstore::{
    AggregateVersion, AppendRequest, CancellationToken, CommandError, EventLog, EventQuery,
    ExpectedVersion, Sequence, StoreError, StoredEvent, TenantId, execute, load,
};
use iamstore_memory::InMemoryStore;
use iamstore_testing::fixtures;
use proptest::prelude::*;
use serde_json::json;

/// Log that lets a rival writer append to the same aggregate right before
/// each of the first `races` appends.
struct RacingLog {
    store: InMemoryStore,
    races: AtomicUsize,
}

impl RacingLog {
    fn new(store: InMemoryStore, races: usize) -> Self {
        Self {
            store,
            races: AtomicUsize::new(races),
        }
    }
}

impl EventLog for RacingLog {
    async fn append(&self, request: AppendRequest) -> Result<Vec<StoredEvent>, StoreError> {
        if self
            .races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            let rival = AppendRequest::new(
                request.tenant().clone(),
                request.aggregate().clone(),
                ExpectedVersion::Any,
            )
            .with_pending_event(fixtures::pending(
                "user.renamed",
                json!({ "login_name": "rival" }),
            ))
            .build()?;
            let _ = self.store.append(rival).await?;
        }
        self.store.append(request).await
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError> {
        self.store.query(query).await
    }

    async fn latest_sequence(&self, query: &EventQuery) -> Result<Sequence, StoreError> {
        self.store.latest_sequence(query).await
    }

    async fn tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        self.store.tenants().await
    }
}

fn rename_event(login_name: &str) -> UserEvent {
    UserEvent::Renamed(common::UserRenamed {
        login_name: login_name.to_string(),
    })
}

#[tokio::test]
async fn appends_against_the_loaded_version() {
    // Given: an existing user
    let store = InMemoryStore::new();
    let tenant = fixtures::tenant("acme");
    let alice = add_user(&store, &tenant, "alice")
        .await
        .expect("alice added");

    // When: renaming through a command
    let committed = execute(
        &store,
        &policy(),
        &CancellationToken::new(),
        &tenant,
        &alice,
        |history, request| {
            assert_eq!(history.version, AggregateVersion::new(1));
            Ok::<_, UserError>(request.with_event(&fixtures::editor(), &rename_event("alicia")))
        },
    )
    .await
    .expect("command succeeds");

    // Then: the event lands on version 2 and the history reflects it
    assert_eq!(committed[0].aggregate_version, AggregateVersion::new(2));
    let history = load(&store, &tenant, &alice).await.expect("load succeeds");
    assert_eq!(history.version, AggregateVersion::new(2));
    assert_eq!(history.events.len(), 2);
    assert!(!history.is_new());
}

#[tokio::test]
async fn rejected_commands_append_nothing() {
    // Given: an existing user
    let store = InMemoryStore::new();
    let tenant = fixtures::tenant("acme");
    let alice = add_user(&store, &tenant, "alice")
        .await
        .expect("alice added");

    // When: adding the same aggregate again
    let result = execute(
        &store,
        &policy(),
        &CancellationToken::new(),
        &tenant,
        &alice,
        |history, request| {
            if !history.is_new() {
                return Err(UserError::AlreadyExists);
            }
            Ok(request.with_event(
                &fixtures::editor(),
                &UserEvent::Added(UserAdded {
                    login_name: "alice".to_string(),
                }),
            ))
        },
    )
    .await;

    // Then: the decision's error is returned and the log is unchanged
    assert!(matches!(
        result,
        Err(CommandError::Rejected(UserError::AlreadyExists))
    ));
    let latest = store
        .latest_sequence(&EventQuery::tenant(tenant))
        .await
        .expect("query succeeds");
    assert_eq!(latest, Sequence::new(1));
}

#[tokio::test]
async fn constraint_violations_are_not_retried() {
    // Given: alice's login name is claimed
    let store = InMemoryStore::new();
    let tenant = fixtures::tenant("acme");
    let _ = add_user(&store, &tenant, "alice")
        .await
        .expect("alice added");
    let decisions = AtomicUsize::new(0);

    // When: another user claims the same login name
    let result = execute(
        &store,
        &policy(),
        &CancellationToken::new(),
        &tenant,
        &fixtures::user(),
        |_, request| {
            let _ = decisions.fetch_add(1, Ordering::SeqCst);
            Ok::<_, UserError>(
                request
                    .with_event(
                        &fixtures::editor(),
                        &UserEvent::Added(UserAdded {
                            login_name: "alice".to_string(),
                        }),
                    )
                    .claim_unique(fixtures::login_name("alice")),
            )
        },
    )
    .await;

    // Then: the violation is returned after a single attempt
    assert!(matches!(
        result,
        Err(CommandError::Store(StoreError::ConstraintViolation { .. }))
    ));
    assert_eq!(decisions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn conflicts_reload_and_decide_again() {
    // Given: a user and a rival writer that wins the first race
    let store = InMemoryStore::new();
    let tenant = fixtures::tenant("acme");
    let alice = add_user(&store, &tenant, "alice")
        .await
        .expect("alice added");
    let log = RacingLog::new(store.clone(), 1);
    let decisions = AtomicUsize::new(0);

    // When: renaming
    let committed = execute(
        &log,
        &policy(),
        &CancellationToken::new(),
        &tenant,
        &alice,
        |_, request| {
            let _ = decisions.fetch_add(1, Ordering::SeqCst);
            Ok::<_, UserError>(request.with_event(&fixtures::editor(), &rename_event("alicia")))
        },
    )
    .await
    .expect("command succeeds after reload");

    // Then: the second decision saw the rival's event and appended after it
    assert_eq!(decisions.load(Ordering::SeqCst), 2);
    assert_eq!(committed[0].aggregate_version, AggregateVersion::new(3));
}

#[tokio::test]
async fn persistent_conflicts_exhaust_the_policy() {
    // Given: a rival that wins every race
    let store = InMemoryStore::new();
    let tenant = fixtures::tenant("acme");
    let alice = add_user(&store, &tenant, "alice")
        .await
        .expect("alice added");
    let log = RacingLog::new(store.clone(), usize::MAX);
    let decisions = AtomicUsize::new(0);

    // When: renaming
    let result = execute(
        &log,
        &policy(),
        &CancellationToken::new(),
        &tenant,
        &alice,
        |_, request| {
            let _ = decisions.fetch_add(1, Ordering::SeqCst);
            Ok::<_, UserError>(request.with_event(&fixtures::editor(), &rename_event("alicia")))
        },
    )
    .await;

    // Then: the conflict surfaces after every attempt was used
    assert!(matches!(
        result,
        Err(CommandError::Store(StoreError::ConcurrencyConflict { .. }))
    ));
    assert_eq!(decisions.load(Ordering::SeqCst), policy().attempts() as usize);
}

#[tokio::test]
async fn empty_decisions_are_rejected_by_the_store() {
    let store = InMemoryStore::new();
    let tenant = fixtures::tenant("acme");

    let result = execute(
        &store,
        &policy(),
        &CancellationToken::new(),
        &tenant,
        &fixtures::user(),
        |_, request| Ok::<_, UserError>(request),
    )
    .await;

    assert!(matches!(
        result,
        Err(CommandError::Store(StoreError::NothingToAppend))
    ));
}

#[tokio::test]
async fn cancelled_commands_append_nothing() {
    let store = InMemoryStore::new();
    let tenant = fixtures::tenant("acme");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = execute(
        &store,
        &policy(),
        &cancel,
        &tenant,
        &fixtures::user(),
        |_, request| {
            Ok::<_, UserError>(request.with_event(
                &fixtures::editor(),
                &UserEvent::Added(UserAdded {
                    login_name: "alice".to_string(),
                }),
            ))
        },
    )
    .await;

    assert!(matches!(result, Err(CommandError::Cancelled)));
    assert!(store.tenants().await.expect("tenants load").is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn sequences_are_gap_free_across_interleaved_aggregates(
        targets in prop::collection::vec(0usize..4, 1..40)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime builds");

        runtime.block_on(async {
            let store = InMemoryStore::new();
            let tenant = fixtures::tenant("acme");
            let users: Vec<_> = (0..4).map(|_| fixtures::user()).collect();

            for &target in &targets {
                let request = AppendRequest::new(
                    tenant.clone(),
                    users[target].clone(),
                    ExpectedVersion::Any,
                )
                .with_pending_event(fixtures::pending("user.renamed", json!({ "login_name": "x" })))
                .build()
                .expect("request builds");
                let _ = store.append(request).await.expect("append succeeds");
            }

            let events = store
                .query(&EventQuery::tenant(tenant.clone()).aggregate_types([user_type()]))
                .await
                .expect("query succeeds");
            let sequences: Vec<u64> = events.iter().map(|event| event.sequence.into_inner()).collect();
            let expected: Vec<u64> = (1..=targets.len() as u64).collect();
            assert_eq!(sequences, expected);

            for user in &users {
                let versions: Vec<u64> = events
                    .iter()
                    .filter(|event| event.aggregate_id == user.aggregate_id)
                    .map(|event| event.aggregate_version.into_inner())
                    .collect();
                let expected: Vec<u64> = (1..=versions.len() as u64).collect();
                assert_eq!(versions, expected);
            }
        });
    }
}
