//! Errors returned by the projection engine.

use iamstore_types::{ProjectionName, Sequence, StoreError, TenantId};
use thiserror::Error;

/// Errors that can occur while catching up or reading projections.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// No projection with this name is registered.
    #[error("unknown projection: {projection}")]
    UnknownProjection {
        /// Requested name.
        projection: ProjectionName,
    },

    /// Two projections were registered under the same name.
    #[error("projection {projection} is registered twice")]
    DuplicateProjection {
        /// Conflicting name.
        projection: ProjectionName,
    },

    /// No ledger entry exists for this event.
    #[error("no failed event {sequence} for projection {projection} in tenant {tenant}")]
    UnknownFailedEvent {
        /// Projection name.
        projection: ProjectionName,
        /// Tenant.
        tenant: TenantId,
        /// Sequence of the event.
        sequence: Sequence,
    },

    /// A row document did not match the requested type.
    #[error("projection {projection} row could not be decoded: {detail}")]
    RowDecodeFailed {
        /// Projection name.
        projection: ProjectionName,
        /// Deserializer message.
        detail: String,
    },

    /// The caller cancelled the operation. Batches committed before
    /// cancellation stay committed.
    #[error("projection operation cancelled")]
    Cancelled,

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProjectionError {
    /// Returns true if repeating the operation may succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(error) => error.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for projection engine operations.
pub type ProjectionResult<T> = Result<T, ProjectionError>;
