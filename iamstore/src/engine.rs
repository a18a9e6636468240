//! Projection engine: incremental, resumable catch-up of materialized views.
//!
//! Each (projection, tenant) pair moves `Idle -> Catching-up -> Idle`. A
//! catch-up pass:
//!
//! 1. pins the target to the tenant's latest matching sequence
//! 2. retries ledger entries below the failure cap
//! 3. reduces new events in sequence order, one batch at a time
//! 4. commits each batch with its sequence advance in one transaction
//!
//! Passes are safe to run concurrently on several instances. A batch that
//! another runner already committed comes back stale and is skipped.
//!
//! A ledger entry that succeeds on retry is applied after the events that
//! followed it. Its rows are rebuilt by replaying it together with every later
//! statement on those rows, up to the current position, so the late event
//! neither loses its effect to the row guard nor resurrects a deleted row.

use crate::config::EngineConfig;
use crate::errors::{ProjectionError, ProjectionResult};
use crate::projection::{Projection, ProjectionHandler, Projector};
use crate::spooler::Spooler;
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use iamstore_types::{
    BatchCommit, EntityId, EventLog, FailedEventLedger, HandlerFailure, PendingStatement,
    ProjectionBatch, ProjectionName, ProjectionRow, ProjectionStore, Sequence, SequenceTracker,
    Statement, StoredEvent, TenantId,
};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Every capability the engine needs from a backend.
pub trait ProjectionBackend:
    EventLog + ProjectionStore + SequenceTracker + FailedEventLedger + Send + Sync + 'static
{
}

impl<T> ProjectionBackend for T where
    T: EventLog + ProjectionStore + SequenceTracker + FailedEventLedger + Send + Sync + 'static
{
}

/// How fresh a projection read must be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadConsistency {
    /// Read whatever the projection currently holds.
    #[default]
    Eventual,
    /// Catch the projection up to the latest event first (read-your-writes).
    Triggered,
}

/// Outcome of one catch-up pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpReport {
    /// Projection that was caught up.
    pub projection: ProjectionName,
    /// Tenant that was caught up.
    pub tenant: TenantId,
    /// Sequence the pass aimed for.
    pub target: Sequence,
    /// Position after the pass.
    pub position: Sequence,
    /// Events reduced and committed by this runner.
    pub processed: usize,
    /// Events whose handler failed in this pass (new or retried).
    pub failed: usize,
    /// Ledger entries that succeeded on retry.
    pub resolved: usize,
    /// Batches skipped because another runner had committed them.
    pub stale_batches: usize,
}

impl CatchUpReport {
    fn new(projection: ProjectionName, tenant: TenantId, target: Sequence) -> Self {
        Self {
            projection,
            tenant,
            target,
            position: Sequence::zero(),
            processed: 0,
            failed: 0,
            resolved: 0,
            stale_batches: 0,
        }
    }
}

struct EngineInner<S> {
    store: S,
    config: EngineConfig,
    projections: BTreeMap<ProjectionName, Arc<dyn ProjectionHandler>>,
    in_flight: Mutex<HashMap<(ProjectionName, TenantId), Arc<Mutex<()>>>>,
}

/// Drives registered projections over a backend.
///
/// Cheap to clone; clones share the backend and the in-process catch-up locks.
pub struct ProjectionEngine<S> {
    inner: Arc<EngineInner<S>>,
}

impl<S> Clone for ProjectionEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`ProjectionEngine`].
pub struct ProjectionEngineBuilder<S> {
    store: S,
    config: EngineConfig,
    projections: BTreeMap<ProjectionName, Arc<dyn ProjectionHandler>>,
}

impl<S: ProjectionBackend> ProjectionEngineBuilder<S> {
    /// Replaces the default configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a typed projection.
    pub fn register<P: Projection>(self, projection: P) -> ProjectionResult<Self> {
        self.register_handler(Arc::new(Projector::new(projection)))
    }

    /// Registers an already type-erased handler.
    pub fn register_handler(
        mut self,
        handler: Arc<dyn ProjectionHandler>,
    ) -> ProjectionResult<Self> {
        let name = handler.name().clone();
        if self.projections.contains_key(&name) {
            return Err(ProjectionError::DuplicateProjection { projection: name });
        }
        let _ = self.projections.insert(name, handler);
        Ok(self)
    }

    /// Finalizes the engine.
    pub fn build(self) -> ProjectionEngine<S> {
        ProjectionEngine {
            inner: Arc::new(EngineInner {
                store: self.store,
                config: self.config,
                projections: self.projections,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl<S: ProjectionBackend> ProjectionEngine<S> {
    /// Starts building an engine over `store`.
    pub fn builder(store: S) -> ProjectionEngineBuilder<S> {
        ProjectionEngineBuilder {
            store,
            config: EngineConfig::default(),
            projections: BTreeMap::new(),
        }
    }

    /// The backend.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Names of all registered projections, ascending.
    pub fn views(&self) -> Vec<ProjectionName> {
        self.inner.projections.keys().cloned().collect()
    }

    /// Background catch-up over every tenant and projection.
    pub fn spooler(&self) -> Spooler<S> {
        Spooler::new(self.clone(), self.inner.config.spooler.clone())
    }

    pub(crate) fn handler(
        &self,
        projection: &ProjectionName,
    ) -> ProjectionResult<Arc<dyn ProjectionHandler>> {
        self.inner
            .projections
            .get(projection)
            .cloned()
            .ok_or_else(|| ProjectionError::UnknownProjection {
                projection: projection.clone(),
            })
    }

    /// Catches one projection up for one tenant, returning once it has
    /// processed every event visible when the call started.
    ///
    /// Concurrent triggers for the same pair within this process run one after
    /// the other; the second usually finds nothing left to do.
    #[instrument(name = "projection.trigger", skip_all, fields(projection = %projection, tenant = %tenant))]
    pub async fn trigger(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        cancel: &CancellationToken,
    ) -> ProjectionResult<CatchUpReport> {
        let handler = self.handler(projection)?;
        let pair_lock = self.pair_lock(projection, tenant).await;

        cancellable(cancel, async {
            let _guard = pair_lock.lock().await;
            self.catch_up(handler.as_ref(), tenant).await
        })
        .await
    }

    /// Catches every registered projection up for one tenant, at most
    /// `spooler.concurrency` at a time. Reports follow [`Self::views`] order.
    #[instrument(name = "projection.trigger_all", skip_all, fields(tenant = %tenant))]
    pub async fn trigger_all(
        &self,
        tenant: &TenantId,
        cancel: &CancellationToken,
    ) -> ProjectionResult<Vec<CatchUpReport>> {
        let names = self.views();
        stream::iter(&names)
            .map(|projection| self.trigger(projection, tenant, cancel))
            .buffered(self.inner.config.spooler.concurrency.max(1))
            .try_collect()
            .await
    }

    /// Reads one row.
    pub async fn get(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        entity_id: &EntityId,
        consistency: ReadConsistency,
        cancel: &CancellationToken,
    ) -> ProjectionResult<Option<ProjectionRow>> {
        self.prepare_read(projection, tenant, consistency, cancel)
            .await?;
        Ok(self
            .inner
            .store
            .row(projection, tenant, entity_id)
            .await?)
    }

    /// Reads every row of a tenant, ordered by entity id.
    pub async fn list(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        consistency: ReadConsistency,
        cancel: &CancellationToken,
    ) -> ProjectionResult<Vec<ProjectionRow>> {
        self.prepare_read(projection, tenant, consistency, cancel)
            .await?;
        Ok(self.inner.store.rows(projection, tenant).await?)
    }

    /// Reads one row and decodes its document.
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        entity_id: &EntityId,
        consistency: ReadConsistency,
        cancel: &CancellationToken,
    ) -> ProjectionResult<Option<T>> {
        let Some(row) = self
            .get(projection, tenant, entity_id, consistency, cancel)
            .await?
        else {
            return Ok(None);
        };

        serde_json::from_value(row.data)
            .map(Some)
            .map_err(|error| ProjectionError::RowDecodeFailed {
                projection: projection.clone(),
                detail: error.to_string(),
            })
    }

    async fn prepare_read(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        consistency: ReadConsistency,
        cancel: &CancellationToken,
    ) -> ProjectionResult<()> {
        match consistency {
            ReadConsistency::Eventual => self.handler(projection).map(|_| ()),
            ReadConsistency::Triggered => self.trigger(projection, tenant, cancel).await.map(|_| ()),
        }
    }

    async fn pair_lock(&self, projection: &ProjectionName, tenant: &TenantId) -> Arc<Mutex<()>> {
        let mut in_flight = self.inner.in_flight.lock().await;
        Arc::clone(
            in_flight
                .entry((projection.clone(), tenant.clone()))
                .or_default(),
        )
    }

    async fn catch_up(
        &self,
        handler: &dyn ProjectionHandler,
        tenant: &TenantId,
    ) -> ProjectionResult<CatchUpReport> {
        let store = &self.inner.store;
        let name = handler.name();
        let selection = handler.selection(tenant);

        let target = store.latest_sequence(&selection).await?;
        let mut report = CatchUpReport::new(name.clone(), tenant.clone(), target);

        self.retry_failed_events(handler, tenant, &mut report)
            .await?;

        let mut position = store.current_sequence(name, tenant).await?;

        while position < target {
            let query = selection
                .clone()
                .after(position)
                .up_to(target)
                .limit(self.inner.config.batch_size);
            let events = store.query(&query).await?;

            let Some(last) = events.last().map(|event| event.sequence) else {
                break;
            };

            let mut batch = ProjectionBatch::new(name.clone(), tenant.clone(), Utc::now());
            let failed = reduce_into(handler, &events, &mut batch);
            batch.advance_to = Some(last);

            match store.commit_batch(batch).await? {
                BatchCommit::Applied => {
                    debug!(
                        projection = %name,
                        tenant = %tenant,
                        events = events.len(),
                        failed,
                        position = %last,
                        "[projection.catch_up] batch committed"
                    );
                    report.processed += events.len();
                    report.failed += failed;
                    position = last;
                }
                BatchCommit::Stale { current } => {
                    debug!(
                        projection = %name,
                        tenant = %tenant,
                        attempted = %last,
                        current = %current,
                        "[projection.catch_up] batch already committed elsewhere"
                    );
                    report.stale_batches += 1;
                    position = current;
                }
            }
        }

        report.position = position;
        if report.processed > 0 || report.resolved > 0 || report.failed > 0 {
            info!(
                projection = %name,
                tenant = %tenant,
                processed = report.processed,
                failed = report.failed,
                resolved = report.resolved,
                position = %position,
                "[projection.catch_up] caught up"
            );
        }
        Ok(report)
    }

    /// Re-runs the handler for ledger entries still below the failure cap.
    /// Successes leave the ledger; failures count up until the entry is parked.
    ///
    /// The retry batch is computed against the current position and commits
    /// only if that position is unchanged; otherwise the next pass retries.
    async fn retry_failed_events(
        &self,
        handler: &dyn ProjectionHandler,
        tenant: &TenantId,
        report: &mut CatchUpReport,
    ) -> ProjectionResult<()> {
        let store = &self.inner.store;
        let name = handler.name();
        let max_failure_count = self.inner.config.max_failure_count;

        let (retryable, parked): (BTreeSet<Sequence>, BTreeSet<Sequence>) = {
            let (retryable, parked): (Vec<_>, Vec<_>) = store
                .failed_events(Some(name), Some(tenant))
                .await?
                .into_iter()
                .partition(|failed| failed.failure_count < max_failure_count);
            (
                retryable.iter().map(|failed| failed.failed_sequence).collect(),
                parked.iter().map(|failed| failed.failed_sequence).collect(),
            )
        };
        let Some(first) = retryable.first().copied() else {
            return Ok(());
        };

        let position = store.current_sequence(name, tenant).await?;
        let mut batch = ProjectionBatch::new(name.clone(), tenant.clone(), Utc::now());
        batch.replayed_through = Some(position);

        let selection = handler.selection(tenant);
        let mut rebuild = Rebuild::default();
        let mut found = BTreeSet::new();
        let (mut resolved, mut failed) = (0, 0);
        let mut after = Sequence::new(first.into_inner().saturating_sub(1));

        while after < position {
            let query = selection
                .clone()
                .after(after)
                .up_to(position)
                .limit(self.inner.config.batch_size);
            let events = store.query(&query).await?;
            let Some(last) = events.last().map(|event| event.sequence) else {
                break;
            };

            for event in &events {
                if retryable.contains(&event.sequence) {
                    let _ = found.insert(event.sequence);
                    match handler.handle(event) {
                        Ok(statements) => {
                            rebuild.track(&statements);
                            push_statements(&mut batch, event, statements, position);
                            batch.resolved.push(event.sequence);
                            resolved += 1;
                        }
                        Err(error) => {
                            warn!(
                                projection = %name,
                                tenant = %tenant,
                                sequence = %event.sequence,
                                error = %error,
                                "[projection.retry_failed] handler failed again"
                            );
                            batch.failures.push(HandlerFailure {
                                sequence: event.sequence,
                                error_message: error.to_string(),
                            });
                            failed += 1;
                        }
                    }
                } else if rebuild.is_active() && !parked.contains(&event.sequence) {
                    match handler.handle(event) {
                        Ok(statements) => {
                            let replayed = rebuild.affecting(statements);
                            push_statements(&mut batch, event, replayed, position);
                        }
                        Err(error) => debug!(
                            projection = %name,
                            sequence = %event.sequence,
                            error = %error,
                            "[projection.retry_failed] skipping event the handler rejects on replay"
                        ),
                    }
                }
            }
            after = last;
        }

        // Entries whose event no longer matches the projection's selection.
        for sequence in retryable.difference(&found) {
            if *sequence <= position {
                batch.resolved.push(*sequence);
            }
        }

        match store.commit_batch(batch).await? {
            BatchCommit::Applied => {
                report.resolved += resolved;
                report.failed += failed;
            }
            BatchCommit::Stale { current } => debug!(
                projection = %name,
                tenant = %tenant,
                replayed_through = %position,
                current = %current,
                "[projection.retry_failed] position moved during replay, retrying next pass"
            ),
        }
        Ok(())
    }
}

/// Rows touched by recovered ledger entries during one retry pass.
#[derive(Debug, Default)]
struct Rebuild {
    entities: HashSet<EntityId>,
    all_rows: bool,
}

impl Rebuild {
    fn is_active(&self) -> bool {
        self.all_rows || !self.entities.is_empty()
    }

    fn track(&mut self, statements: &[Statement]) {
        for statement in statements {
            match statement.entity_id() {
                Some(entity_id) => {
                    let _ = self.entities.insert(entity_id.clone());
                }
                None => self.all_rows = true,
            }
        }
    }

    /// Statements of a later event that must be replayed on the tracked rows.
    fn affecting(&self, statements: Vec<Statement>) -> Vec<Statement> {
        if self.all_rows {
            return statements;
        }
        statements
            .into_iter()
            .flat_map(|statement| match statement {
                Statement::DeleteAll => self
                    .entities
                    .iter()
                    .map(|entity_id| Statement::Delete {
                        entity_id: entity_id.clone(),
                    })
                    .collect(),
                statement
                    if statement
                        .entity_id()
                        .is_some_and(|entity_id| self.entities.contains(entity_id)) =>
                {
                    vec![statement]
                }
                _ => Vec::new(),
            })
            .collect()
    }
}

/// Reduces `events` in order into `batch`, recording handler failures instead
/// of stopping. Returns the number of failures.
fn reduce_into(
    handler: &dyn ProjectionHandler,
    events: &[StoredEvent],
    batch: &mut ProjectionBatch,
) -> usize {
    let mut failed = 0;
    for event in events {
        match handler.handle(event) {
            Ok(statements) => push_statements(batch, event, statements, event.sequence),
            Err(error) => {
                warn!(
                    projection = %handler.name(),
                    tenant = %event.tenant,
                    sequence = %event.sequence,
                    event_type = %event.event_type,
                    error = %error,
                    "[projection.handler_failed] recording failed event and continuing"
                );
                batch.failures.push(HandlerFailure {
                    sequence: event.sequence,
                    error_message: error.to_string(),
                });
                failed += 1;
            }
        }
    }
    failed
}

/// Queues `statements` of `event`, stamped with `sequence` for the row guard.
fn push_statements(
    batch: &mut ProjectionBatch,
    event: &StoredEvent,
    statements: Vec<Statement>,
    sequence: Sequence,
) {
    batch
        .statements
        .extend(statements.into_iter().map(|statement| PendingStatement {
            sequence,
            created_at: event.created_at,
            statement,
        }));
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = ProjectionResult<T>>,
) -> ProjectionResult<T> {
    if cancel.is_cancelled() {
        return Err(ProjectionError::Cancelled);
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ProjectionError::Cancelled),
        result = operation => result,
    }
}
