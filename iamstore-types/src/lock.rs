//! Lease-based exclusive locks over named resources.

use crate::ids::{LockKey, OwnerId};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// A granted, time-bounded lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Locked resource.
    pub key: LockKey,
    /// Holder of the lease.
    pub owner: OwnerId,
    /// When the lease lapses unless renewed, by the store's clock.
    pub expires_at: DateTime<Utc>,
}

/// Outcome of one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller now holds the lease.
    Granted(Lease),
    /// Another owner holds a live lease. Not an error.
    Denied {
        /// Current holder, when the store reports it.
        holder: Option<OwnerId>,
    },
}

impl LockOutcome {
    /// Returns true if the lease was granted.
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Non-blocking mutual exclusion shared by every service instance.
///
/// At most one live lease exists per key. Acquisition never waits: a held key
/// yields [`LockOutcome::Denied`] immediately.
pub trait TaskLock {
    /// Try to take the lease for `ttl`.
    ///
    /// Succeeds when the key is free, the previous lease has expired, or
    /// `owner` already holds it (the lease is renewed).
    fn try_acquire(
        &self,
        key: &LockKey,
        owner: &OwnerId,
        ttl: Duration,
    ) -> impl Future<Output = Result<LockOutcome, StoreError>> + Send;

    /// Give up the lease. Returns false if `owner` did not hold it.
    fn release(
        &self,
        key: &LockKey,
        owner: &OwnerId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

impl<T: TaskLock + Sync> TaskLock for &T {
    async fn try_acquire(
        &self,
        key: &LockKey,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<LockOutcome, StoreError> {
        (*self).try_acquire(key, owner, ttl).await
    }

    async fn release(&self, key: &LockKey, owner: &OwnerId) -> Result<bool, StoreError> {
        (*self).release(key, owner).await
    }
}
