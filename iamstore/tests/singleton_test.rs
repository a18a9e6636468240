//! Singleton key generation across competing instances.
//!
//! Scenario: signing keys are rotated exactly once
//! - Given several service instances sharing one store
//! - When each of them notices that no current signing key exists
//! - Then exactly one generates a key and the others stand down

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use iamstore::{
    AggregateVersion, AppendRequest, CancellationToken, DomainEvent, EventLog, EventQuery,
    EventType, ExpectedVersion, LockKey, LockOutcome, OverlapPolicy, OwnerId, RetryPolicy,
    Sequence, SingletonConfig, SingletonError, SingletonOutcome, SingletonRunner, SingletonTask,
    StoreError, TaskLock, TenantId, ValidityWindow,
};
use iamstore_memory::InMemoryStore;
use iamstore_testing::fixtures;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const KEY_PAIR_ADDED: &str = "key_pair.added";

#[derive(Debug, Serialize, Deserialize)]
struct KeyPairAdded {
    window: ValidityWindow,
}

impl DomainEvent for KeyPairAdded {
    fn event_type(&self) -> EventType {
        fixtures::event_type(KEY_PAIR_ADDED)
    }

    fn payload(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

#[derive(Debug, Error)]
enum KeyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stored key pair is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("key material could not be generated")]
    GenerationFailed,
}

/// Generates a signing key pair per tenant when the latest one is no longer
/// usable for signing.
#[derive(Clone)]
struct SigningKeys {
    log: InMemoryStore,
    lifetime: ChronoDuration,
    overlap: OverlapPolicy,
    generated: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
}

impl SigningKeys {
    fn new(log: InMemoryStore) -> Self {
        Self {
            log,
            lifetime: ChronoDuration::hours(6),
            overlap: OverlapPolicy::new(ChronoDuration::hours(1)),
            generated: Arc::new(AtomicUsize::new(0)),
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }
}

fn key_pairs(tenant: &TenantId) -> EventQuery {
    EventQuery::tenant(tenant.clone())
        .aggregate_types([fixtures::aggregate("key_pair").aggregate_type])
        .event_types([fixtures::event_type(KEY_PAIR_ADDED)])
}

impl SingletonTask for SigningKeys {
    type Error = KeyError;

    fn lock_key(&self, tenant: &TenantId) -> LockKey {
        LockKey::try_new(format!("signing_key:{tenant}")).expect("valid lock key")
    }

    fn governing_events(&self, tenant: &TenantId) -> EventQuery {
        key_pairs(tenant)
    }

    async fn is_current(&self, tenant: &TenantId) -> Result<bool, KeyError> {
        let events = self.log.query(&key_pairs(tenant)).await?;
        let Some(latest) = events.last() else {
            return Ok(false);
        };
        let added: KeyPairAdded = serde_json::from_value(latest.payload.clone())?;
        Ok(self.overlap.is_current(&added.window, Utc::now()))
    }

    async fn generate(&self, tenant: &TenantId) -> Result<(), KeyError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(KeyError::GenerationFailed);
        }
        let added = KeyPairAdded {
            window: ValidityWindow::starting_at(Utc::now(), self.lifetime),
        };
        let request = AppendRequest::new(
            tenant.clone(),
            fixtures::aggregate("key_pair"),
            ExpectedVersion::Exact(AggregateVersion::initial()),
        )
        .with_event(&fixtures::editor(), &added)
        .build()?;
        let _ = self.log.append(request).await?;
        let _ = self.generated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Lock whose first acquisition races with another instance that generates
/// a key just before the lease is granted.
struct RacingLock {
    store: InMemoryStore,
    rival: SigningKeys,
    tenant: TenantId,
    raced: AtomicBool,
}

impl TaskLock for RacingLock {
    async fn try_acquire(
        &self,
        key: &LockKey,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<LockOutcome, StoreError> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            self.rival
                .generate(&self.tenant)
                .await
                .expect("rival generates a key");
        }
        self.store.try_acquire(key, owner, ttl).await
    }

    async fn release(&self, key: &LockKey, owner: &OwnerId) -> Result<bool, StoreError> {
        self.store.release(key, owner).await
    }
}

fn config(attempts: u32) -> SingletonConfig {
    SingletonConfig {
        lock_ttl: Duration::from_secs(30),
        retry: RetryPolicy::fixed(attempts, Duration::from_millis(10)),
    }
}

fn runner(store: &InMemoryStore, attempts: u32) -> SingletonRunner<InMemoryStore, InMemoryStore> {
    SingletonRunner::new(
        store.clone(),
        store.clone(),
        OwnerId::generate(),
        config(attempts),
    )
}

#[tokio::test]
async fn generates_once_then_reports_current_material() {
    // Given: a tenant without signing keys
    let store = InMemoryStore::new();
    let task = SigningKeys::new(store.clone());
    let runner = runner(&store, 3);
    let tenant = fixtures::tenant("acme");
    let cancel = CancellationToken::new();

    // When: running the workflow twice
    let first = runner.run(&task, &tenant, &cancel).await;
    let second = runner.run(&task, &tenant, &cancel).await;

    // Then: the first run generates and the second finds the key current
    assert!(matches!(
        first,
        Ok(SingletonOutcome::Generated { observed }) if observed == Sequence::zero()
    ));
    assert!(matches!(second, Ok(SingletonOutcome::AlreadyCurrent)));
    assert_eq!(task.generated(), 1);

    // And: the lease was released
    let other = OwnerId::generate();
    let outcome = store
        .try_acquire(&task.lock_key(&tenant), &other, Duration::from_secs(1))
        .await
        .expect("acquire succeeds");
    assert!(outcome.is_granted());
}

#[tokio::test]
async fn material_inside_the_overlap_is_rotated() {
    // Given: a key that expires within the overlap period
    let store = InMemoryStore::new();
    let tenant = fixtures::tenant("acme");
    let expiring = SigningKeys {
        lifetime: ChronoDuration::minutes(30),
        ..SigningKeys::new(store.clone())
    };
    expiring
        .generate(&tenant)
        .await
        .expect("expiring key is stored");
    let task = SigningKeys::new(store.clone());

    // When: running the workflow
    let outcome = runner(&store, 3)
        .run(&task, &tenant, &CancellationToken::new())
        .await;

    // Then: a successor is generated against the observed key event
    assert!(matches!(
        outcome,
        Ok(SingletonOutcome::Generated { observed }) if observed == Sequence::new(1)
    ));
    assert_eq!(task.generated(), 1);
}

#[tokio::test]
async fn a_held_lock_means_another_instance_is_handling_it() {
    // Given: another instance holding the generation lock
    let store = InMemoryStore::new();
    let task = SigningKeys::new(store.clone());
    let tenant = fixtures::tenant("acme");
    let other = OwnerId::generate();
    let held = store
        .try_acquire(&task.lock_key(&tenant), &other, Duration::from_secs(60))
        .await
        .expect("acquire succeeds");
    assert!(held.is_granted());

    // When: this instance runs the workflow
    let outcome = runner(&store, 2)
        .run(&task, &tenant, &CancellationToken::new())
        .await;

    // Then: it stands down without generating
    assert!(matches!(
        outcome,
        Ok(SingletonOutcome::HandledElsewhere { holder: Some(holder) }) if holder == other
    ));
    assert_eq!(task.generated(), 0);
}

#[tokio::test]
async fn log_movement_before_the_lock_supersedes_generation() {
    // Given: a rival that generates between the first read and the lock grant
    let store = InMemoryStore::new();
    let tenant = fixtures::tenant("acme");
    let rival = SigningKeys::new(store.clone());
    let task = SigningKeys::new(store.clone());
    let lock = RacingLock {
        store: store.clone(),
        rival: rival.clone(),
        tenant: tenant.clone(),
        raced: AtomicBool::new(false),
    };
    let runner = SingletonRunner::new(store.clone(), lock, OwnerId::generate(), config(3));

    // When: running the workflow
    let outcome = runner.run(&task, &tenant, &CancellationToken::new()).await;

    // Then: it notices the new key and does not generate another
    assert!(matches!(
        outcome,
        Ok(SingletonOutcome::Superseded { observed, current })
            if observed == Sequence::zero() && current == Sequence::new(1)
    ));
    assert_eq!(task.generated(), 0);
    assert_eq!(rival.generated(), 1);

    // And: the lease was released
    let outcome = store
        .try_acquire(&task.lock_key(&tenant), &OwnerId::generate(), Duration::from_secs(1))
        .await
        .expect("acquire succeeds");
    assert!(outcome.is_granted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_instances_generate_exactly_once() {
    // Given: six instances sharing one store
    let store = InMemoryStore::new();
    let task = SigningKeys::new(store.clone());
    let tenant = fixtures::tenant("acme");

    // When: all of them run the workflow at once
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let runner = runner(&store, 20);
            let task = task.clone();
            let tenant = tenant.clone();
            tokio::spawn(async move {
                runner
                    .run(&task, &tenant, &CancellationToken::new())
                    .await
            })
        })
        .collect();
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(
            handle
                .await
                .expect("task completes")
                .expect("workflow succeeds"),
        );
    }

    // Then: exactly one generated and one key event exists
    let generated = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, SingletonOutcome::Generated { .. }))
        .count();
    assert_eq!(generated, 1, "outcomes: {outcomes:?}");
    assert_eq!(task.generated(), 1);
    let events = store
        .query(&key_pairs(&tenant))
        .await
        .expect("query succeeds");
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn failed_generation_leaves_the_lease_to_expire() {
    // Given: generation that fails
    let store = InMemoryStore::new();
    let task = SigningKeys::new(store.clone());
    task.broken.store(true, Ordering::SeqCst);
    let runner = runner(&store, 3);
    let tenant = fixtures::tenant("acme");

    // When: running the workflow
    let outcome = runner.run(&task, &tenant, &CancellationToken::new()).await;

    // Then: the task error is returned without retrying
    assert!(matches!(
        outcome,
        Err(SingletonError::Task(KeyError::GenerationFailed))
    ));

    // And: the lease is still held by the failed instance
    let other = store
        .try_acquire(&task.lock_key(&tenant), &OwnerId::generate(), Duration::from_secs(1))
        .await
        .expect("acquire succeeds");
    assert!(matches!(
        other,
        LockOutcome::Denied { holder: Some(holder) } if &holder == runner.owner()
    ));
}

#[tokio::test]
async fn cancelled_runs_do_nothing() {
    let store = InMemoryStore::new();
    let task = SigningKeys::new(store.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = runner(&store, 3)
        .run(&task, &fixtures::tenant("acme"), &cancel)
        .await;

    assert!(matches!(outcome, Err(SingletonError::Cancelled)));
    assert_eq!(task.generated(), 0);
}
