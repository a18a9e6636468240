//! Singleton generation workflow guarded by a task lock.
//!
//! Used for side effects that are expensive and not idempotent, such as
//! generating signing keys or certificates. Every service instance may call
//! [`SingletonRunner::run`]; at most one of them generates, and only when its
//! view of the tenant's log is current:
//!
//! 1. read the latest sequence of the governing events
//! 2. if the material is still current, stop
//! 3. try the lock; on denial, back off and start over
//! 4. under the lock, re-read the latest sequence; if it moved, stop
//! 5. generate, then release the lock
//!
//! The whole path runs under the shared [`RetryPolicy`](crate::retry::RetryPolicy),
//! because lock contention while several instances start up is expected.

use crate::config::SingletonConfig;
use crate::retry::{RetryError, Retryable, retry};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use iamstore_types::{
    EventLog, EventQuery, LockKey, LockOutcome, OwnerId, Sequence, StoreError, TaskLock, TenantId,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// A side effect that exactly one instance should perform at a time.
pub trait SingletonTask: Send + Sync {
    /// Failure of the task's own steps.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Lock guarding generation for `tenant`.
    fn lock_key(&self, tenant: &TenantId) -> LockKey;

    /// Events whose latest sequence proves the caller's view is current.
    fn governing_events(&self, tenant: &TenantId) -> EventQuery;

    /// Returns true if existing material is still usable and nothing needs generating.
    fn is_current(
        &self,
        tenant: &TenantId,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Generates new material, usually by appending an event.
    fn generate(&self, tenant: &TenantId) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// How a [`SingletonRunner::run`] call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingletonOutcome {
    /// Existing material is current; nothing was done.
    AlreadyCurrent,
    /// This instance generated new material.
    Generated {
        /// Latest governing sequence observed before generating.
        observed: Sequence,
    },
    /// Another instance held the lock for every attempt.
    HandledElsewhere {
        /// Last known holder.
        holder: Option<OwnerId>,
    },
    /// The log moved between the first read and lock acquisition; someone
    /// else already generated.
    Superseded {
        /// Sequence read before acquiring the lock.
        observed: Sequence,
        /// Sequence read under the lock.
        current: Sequence,
    },
}

/// Failures of a singleton run.
#[derive(Debug, Error)]
pub enum SingletonError<E> {
    /// The event log or the lock store failed.
    #[error("singleton store access failed: {0}")]
    Store(StoreError),
    /// The task failed. If this happened after the lock was granted, the lease
    /// is left to expire.
    #[error("singleton task failed: {0}")]
    Task(E),
    /// The caller cancelled the run.
    #[error("singleton run cancelled")]
    Cancelled,
}

#[derive(Debug)]
enum AttemptError<E> {
    Contended { holder: Option<OwnerId> },
    Store(StoreError),
    Task(E),
}

impl<E> Retryable for AttemptError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Contended { .. } => true,
            Self::Store(error) => error.is_retryable(),
            Self::Task(_) => false,
        }
    }
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contended { holder: Some(holder) } => write!(f, "lock held by {holder}"),
            Self::Contended { holder: None } => f.write_str("lock held by another instance"),
            Self::Store(error) => write!(f, "{error}"),
            Self::Task(error) => write!(f, "{error}"),
        }
    }
}

/// Runs [`SingletonTask`]s under a [`TaskLock`] with freshness checks against
/// an [`EventLog`].
pub struct SingletonRunner<L, K> {
    log: L,
    lock: K,
    owner: OwnerId,
    config: SingletonConfig,
}

impl<L, K> SingletonRunner<L, K>
where
    L: EventLog + Sync,
    K: TaskLock + Sync,
{
    /// Creates a runner identified by `owner` in the lock table.
    pub const fn new(log: L, lock: K, owner: OwnerId, config: SingletonConfig) -> Self {
        Self {
            log,
            lock,
            owner,
            config,
        }
    }

    /// This instance's lock owner id.
    pub const fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Runs the read-decide-generate protocol for `tenant`.
    #[instrument(name = "singleton.run", skip(self, task, cancel), fields(owner = %self.owner))]
    pub async fn run<T: SingletonTask>(
        &self,
        task: &T,
        tenant: &TenantId,
        cancel: &CancellationToken,
    ) -> Result<SingletonOutcome, SingletonError<T::Error>> {
        let result = retry(&self.config.retry, cancel, "singleton.run", || {
            self.attempt(task, tenant)
        })
        .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(RetryError::Cancelled) => Err(SingletonError::Cancelled),
            Err(RetryError::Exhausted {
                last_error: AttemptError::Contended { holder },
                ..
            }) => {
                debug!(
                    tenant = %tenant,
                    "[singleton.run] lock stayed contended; another instance is handling it"
                );
                Ok(SingletonOutcome::HandledElsewhere { holder })
            }
            Err(
                RetryError::Exhausted {
                    last_error: AttemptError::Store(error),
                    ..
                }
                | RetryError::Permanent(AttemptError::Store(error)),
            ) => Err(SingletonError::Store(error)),
            Err(
                RetryError::Exhausted {
                    last_error: AttemptError::Task(error),
                    ..
                }
                | RetryError::Permanent(AttemptError::Task(error)),
            ) => Err(SingletonError::Task(error)),
            Err(RetryError::Permanent(AttemptError::Contended { holder })) => {
                Ok(SingletonOutcome::HandledElsewhere { holder })
            }
        }
    }

    async fn attempt<T: SingletonTask>(
        &self,
        task: &T,
        tenant: &TenantId,
    ) -> Result<SingletonOutcome, AttemptError<T::Error>> {
        // Read before deciding, so material generated after the decision
        // shows up as a moved sequence under the lock.
        let governing = task.governing_events(tenant);
        let observed = self
            .log
            .latest_sequence(&governing)
            .await
            .map_err(AttemptError::Store)?;

        if task.is_current(tenant).await.map_err(AttemptError::Task)? {
            return Ok(SingletonOutcome::AlreadyCurrent);
        }

        let key = task.lock_key(tenant);
        match self
            .lock
            .try_acquire(&key, &self.owner, self.config.lock_ttl)
            .await
            .map_err(AttemptError::Store)?
        {
            LockOutcome::Granted(_) => {}
            LockOutcome::Denied { holder } => {
                debug!(key = %key, "[singleton.acquire] lock denied");
                return Err(AttemptError::Contended { holder });
            }
        }

        let current = match self.log.latest_sequence(&governing).await {
            Ok(current) => current,
            Err(error) => {
                self.release(&key).await;
                return Err(AttemptError::Store(error));
            }
        };

        if current != observed {
            info!(
                tenant = %tenant,
                observed = %observed,
                current = %current,
                "[singleton.superseded] log advanced before lock was granted"
            );
            self.release(&key).await;
            return Ok(SingletonOutcome::Superseded { observed, current });
        }

        if let Err(task_error) = task.generate(tenant).await {
            error!(
                tenant = %tenant,
                key = %key,
                error = %task_error,
                "[singleton.generate] generation failed; lease left to expire"
            );
            return Err(AttemptError::Task(task_error));
        }

        self.release(&key).await;
        info!(tenant = %tenant, observed = %observed, "[singleton.generate] material generated");
        Ok(SingletonOutcome::Generated { observed })
    }

    async fn release(&self, key: &LockKey) {
        match self.lock.release(key, &self.owner).await {
            Ok(true) => {}
            Ok(false) => warn!(key = %key, "[singleton.release] lease no longer held"),
            Err(error) => {
                warn!(key = %key, error = %error, "[singleton.release] release failed; lease will expire");
            }
        }
    }
}

/// Period in which a piece of material (key, certificate) is in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
}

impl ValidityWindow {
    /// Creates a window starting at `not_before` and lasting `lifetime`. A
    /// lifetime running past the representable calendar never ends.
    pub fn starting_at(not_before: DateTime<Utc>, lifetime: ChronoDuration) -> Self {
        Self {
            not_before,
            not_after: not_before
                .checked_add_signed(lifetime)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Returns true if `now` lies within the window.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }
}

/// Grace period during which outgoing material stays acceptable after its
/// successor became active, so that instances still using it during rollover
/// do not fail all at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlapPolicy {
    /// How long outgoing material remains accepted.
    pub overlap: ChronoDuration,
}

impl OverlapPolicy {
    /// Creates an overlap policy.
    pub const fn new(overlap: ChronoDuration) -> Self {
        Self { overlap }
    }

    /// Returns true if material in `window` should still be accepted (e.g. for
    /// verification) at `now`, given the activation time of its successor.
    pub fn accepts(
        &self,
        window: &ValidityWindow,
        successor_active_from: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if now < window.not_before {
            return false;
        }
        let retired_at = successor_active_from.map_or(window.not_after, |successor| {
            successor.min(window.not_after)
        });
        // An overlap past the representable calendar never runs out.
        retired_at
            .checked_add_signed(self.overlap)
            .is_none_or(|accepted_until| now < accepted_until)
    }

    /// Returns true if material in `window` can still be used for new work
    /// (e.g. signing) at `now`: it is active and will not expire within the
    /// overlap, leaving time for a successor to be generated and distributed.
    pub fn is_current(&self, window: &ValidityWindow, now: DateTime<Utc>) -> bool {
        window.is_active(now)
            && now
                .checked_add_signed(self.overlap)
                .is_some_and(|needed_until| needed_until < window.not_after)
    }
}
