#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # IAMStore
//!
//! The storage core shared by every command and query of an identity platform:
//!
//! - an append-only, multi-tenant **event log** with optimistic concurrency and
//!   a per-tenant **unique constraint index** updated in the same transaction
//! - a **projection engine** that materializes queryable rows from the log,
//!   inline for read-your-writes ([`ProjectionEngine::trigger`]) and in the
//!   background ([`Spooler`]), recording handler failures in a ledger instead
//!   of stalling
//! - a lease-based **task lock** and [`SingletonRunner`] that let exactly one
//!   of many service instances perform a singleton side effect such as key
//!   rotation
//!
//! Storage is reached through narrow capability traits (`EventLog`,
//! `ProjectionStore`, `SequenceTracker`, `FailedEventLedger`, `TaskLock`)
//! implemented by `iamstore-memory` and `iamstore-postgres`.
//!
//! # Example
//!
//! ```ignore
//! use iamstore::{ProjectionEngine, ReadConsistency, execute};
//!
//! let engine = ProjectionEngine::builder(store.clone())
//!     .register(LoginNames::new())?
//!     .build();
//!
//! execute(&store, &policy, &cancel, &tenant, &user, |history, request| {
//!     Ok(request.with_event(&editor, &UserEvent::Added { .. }))
//! })
//! .await?;
//!
//! let rows = engine
//!     .list(&login_names, &tenant, ReadConsistency::Triggered, &cancel)
//!     .await?;
//! ```

mod admin;
mod command;
pub mod config;
mod engine;
mod errors;
pub mod logging;
mod projection;
mod registry;
pub mod retry;
mod singleton;
mod spooler;

pub use admin::ViewState;
pub use command::{AggregateHistory, CommandError, execute, load};
pub use config::{EngineConfig, SingletonConfig, SpoolerConfig};
pub use engine::{
    CatchUpReport, ProjectionBackend, ProjectionEngine, ProjectionEngineBuilder, ReadConsistency,
};
pub use errors::{ProjectionError, ProjectionResult};
pub use projection::{Projection, ProjectionHandler, Projector, ReduceError};
pub use registry::{EventRegistry, EventRegistryBuilder, RegistryError};
pub use retry::{Backoff, RetryError, RetryPolicy, Retryable, retry};
pub use singleton::{
    OverlapPolicy, SingletonError, SingletonOutcome, SingletonRunner, SingletonTask,
    ValidityWindow,
};
pub use spooler::{Spooler, SpoolerPass};

// Re-export the shared vocabulary so callers depend on one crate.
pub use iamstore_types::*;

pub use tokio_util::sync::CancellationToken;
