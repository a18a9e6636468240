#![forbid(
    invalid_value,
    overflowing_literals,
    unconditional_recursion,
    unsafe_code
)]
#![deny(
    bad_style,
    deprecated,
    non_ascii_idents,
    rust_2018_idioms,
    unreachable_code,
    unused_imports,
    unused_must_use,
    unused_mut
)]

//! Shared vocabulary types and capability traits for IAMStore.
//!
//! This crate provides the types shared between the `iamstore` engine and the
//! storage adapters (`iamstore-memory`, `iamstore-postgres`). Each storage
//! concern is a narrow capability trait so that callers can depend on exactly
//! what they use; a backend implements all of them.
//!
//! # Overview
//!
//! This crate contains:
//! - Capability traits: `EventLog`, `ProjectionStore`, `SequenceTracker`, `FailedEventLedger`, `TaskLock`
//! - Identifiers: `TenantId`, `AggregateType`, `AggregateId`, `EventType`, `ProjectionName`, `LockKey`, ...
//! - Writes: `AppendRequest`, `ExpectedVersion`, `UniqueConstraint`, `PendingEvent`
//! - Reads: `EventQuery`, `StoredEvent`, `ProjectionRow`, `CurrentSequence`, `FailedEvent`
//! - Errors: `StoreError`, `Operation`

mod event;
mod ids;
mod lock;
mod projection;
mod store;
mod validation;

pub use event::{AggregateRef, DomainEvent, PendingEvent, StoredEvent};
pub use ids::{
    AggregateId, AggregateIdError, AggregateType, AggregateTypeError, AggregateVersion,
    ConstraintField, ConstraintFieldError, ConstraintType, ConstraintTypeError, EditorId,
    EditorIdError, EntityId, EntityIdError, EventType, EventTypeError, LockKey, LockKeyError,
    OwnerId, OwnerIdError, ProjectionName, ProjectionNameError, ResourceOwner, ResourceOwnerError,
    Sequence, TenantId, TenantIdError,
};
pub use lock::{Lease, LockOutcome, TaskLock};
pub use projection::{
    BatchCommit, CurrentSequence, FailedEvent, FailedEventLedger, HandlerFailure,
    PendingStatement, ProjectionBatch, ProjectionRow, ProjectionStore, SequenceTracker, Statement,
};
pub use store::{
    AppendRequest, BatchSize, EventLog, EventQuery, ExpectedVersion, Operation, StoreError,
    UniqueConstraint, UniqueConstraintAction,
};
