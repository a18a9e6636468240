//! Optimistic-concurrency command execution.
//!
//! [`execute`] loads an aggregate's history, lets the caller decide which
//! events to append, and appends them against the version it read. When
//! another writer wins the race the whole load-decide-append cycle runs again
//! under the given [`RetryPolicy`].

use crate::retry::{RetryError, RetryPolicy, Retryable, retry};
use iamstore_types::{
    AggregateRef, AggregateVersion, AppendRequest, EventLog, EventQuery, ExpectedVersion,
    StoreError, StoredEvent, TenantId,
};
use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Events of one aggregate, as read before deciding.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateHistory {
    /// Events in version order.
    pub events: Vec<StoredEvent>,
    /// Version of the last event, zero for a new aggregate.
    pub version: AggregateVersion,
}

impl AggregateHistory {
    /// Returns true if the aggregate has no events yet.
    pub fn is_new(&self) -> bool {
        self.events.is_empty()
    }
}

/// Failures of [`execute`].
#[derive(Debug, Error)]
pub enum CommandError<E> {
    /// The decision function rejected the command.
    #[error("command rejected: {0}")]
    Rejected(E),
    /// The store failed, a unique constraint was violated, or conflicts
    /// persisted through every attempt.
    #[error(transparent)]
    Store(StoreError),
    /// The caller cancelled the command.
    #[error("command cancelled")]
    Cancelled,
}

#[derive(Debug)]
enum ExecuteError<E> {
    Rejected(E),
    Store(StoreError),
}

impl<E> Retryable for ExecuteError<E> {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_retryable())
    }
}

impl<E: fmt::Display> fmt::Display for ExecuteError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(error) => write!(f, "{error}"),
            Self::Store(error) => write!(f, "{error}"),
        }
    }
}

impl<E> From<ExecuteError<E>> for CommandError<E> {
    fn from(error: ExecuteError<E>) -> Self {
        match error {
            ExecuteError::Rejected(error) => Self::Rejected(error),
            ExecuteError::Store(error) => Self::Store(error),
        }
    }
}

/// Loads `aggregate`, runs `decide`, and appends the result with
/// `ExpectedVersion::Exact` of the loaded version.
///
/// `decide` receives a request already addressed to the aggregate and returns
/// it with events (and unique constraint changes) added.
///
/// # Example
///
/// ```ignore
/// let committed = execute(&log, &policy, &cancel, &tenant, &user, |history, request| {
///     if !history.is_new() {
///         return Err(UserError::AlreadyExists);
///     }
///     Ok(request
///         .with_event(&editor, &UserEvent::Added { login_name: name.clone() })
///         .claim_unique(login_name(&name)))
/// })
/// .await?;
/// ```
#[instrument(name = "command.execute", skip_all, fields(tenant = %tenant, aggregate_id = %aggregate.aggregate_id))]
pub async fn execute<L, F, E>(
    log: &L,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    tenant: &TenantId,
    aggregate: &AggregateRef,
    decide: F,
) -> Result<Vec<StoredEvent>, CommandError<E>>
where
    L: EventLog + Sync,
    F: Fn(&AggregateHistory, AppendRequest) -> Result<AppendRequest, E>,
    E: fmt::Display,
{
    let result = retry(policy, cancel, "command.execute", || async {
        let history = load(log, tenant, aggregate)
            .await
            .map_err(ExecuteError::Store)?;
        let request = AppendRequest::new(
            tenant.clone(),
            aggregate.clone(),
            ExpectedVersion::Exact(history.version),
        );
        let request = decide(&history, request)
            .map_err(ExecuteError::Rejected)?
            .build()
            .map_err(ExecuteError::Store)?;
        log.append(request).await.map_err(ExecuteError::Store)
    })
    .await;

    match result {
        Ok(events) => Ok(events),
        Err(RetryError::Cancelled) => Err(CommandError::Cancelled),
        Err(RetryError::Exhausted { last_error, .. } | RetryError::Permanent(last_error)) => {
            Err(last_error.into())
        }
    }
}

/// Reads every event of one aggregate.
pub async fn load<L: EventLog + Sync>(
    log: &L,
    tenant: &TenantId,
    aggregate: &AggregateRef,
) -> Result<AggregateHistory, StoreError> {
    let query = EventQuery::tenant(tenant.clone())
        .aggregate_types([aggregate.aggregate_type.clone()])
        .aggregate_ids([aggregate.aggregate_id.clone()]);
    let events = log.query(&query).await?;
    let version = events
        .last()
        .map_or_else(AggregateVersion::initial, |event| event.aggregate_version);
    Ok(AggregateHistory { events, version })
}
