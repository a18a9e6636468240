//! Typed projections and the object-safe handler the engine drives.
//!
//! A [`Projection`] declares which aggregates it follows, decodes their events
//! through its [`EventRegistry`] and reduces each event to idempotent
//! [`Statement`]s. [`Projector`] erases the event type so that one engine can
//! drive many projections.

use crate::registry::{EventRegistry, RegistryError};
use iamstore_types::{
    AggregateType, EventQuery, EventType, ProjectionName, Statement, StoredEvent, TenantId,
};
use thiserror::Error;

/// A projection handler failed on one event.
///
/// Recorded in the failed-event ledger; never surfaced to readers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ReduceError {
    message: String,
}

impl ReduceError {
    /// Creates a reduce error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<RegistryError> for ReduceError {
    fn from(error: RegistryError) -> Self {
        Self::new(error.to_string())
    }
}

impl From<serde_json::Error> for ReduceError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error.to_string())
    }
}

/// A materialized view built from a deterministic reducer.
///
/// `reduce` must be a pure function of the event: the engine may hand the same
/// event to it more than once.
///
/// # Example
///
/// ```ignore
/// impl Projection for LoginNames {
///     type Event = UserEvent;
///
///     fn name(&self) -> ProjectionName { self.name.clone() }
///     fn aggregate_types(&self) -> Vec<AggregateType> { vec![self.user.clone()] }
///     fn registry(&self) -> &EventRegistry<UserEvent> { &self.registry }
///
///     fn reduce(&self, event: UserEvent, stored: &StoredEvent) -> Result<Vec<Statement>, ReduceError> {
///         match event {
///             UserEvent::Added(added) => Ok(vec![Statement::Upsert { .. }]),
///             UserEvent::Removed => Ok(vec![Statement::Delete { .. }]),
///         }
///     }
/// }
/// ```
pub trait Projection: Send + Sync + 'static {
    /// Sum type of the events this projection understands.
    type Event;

    /// Unique name of the projection; also its table name in relational backends.
    fn name(&self) -> ProjectionName;

    /// Aggregate types whose events feed the projection.
    fn aggregate_types(&self) -> Vec<AggregateType>;

    /// Decoders for every event type the projection handles.
    fn registry(&self) -> &EventRegistry<Self::Event>;

    /// Turns one decoded event into row changes.
    fn reduce(
        &self,
        event: Self::Event,
        stored: &StoredEvent,
    ) -> Result<Vec<Statement>, ReduceError>;
}

/// Object-safe projection driven by the engine.
pub trait ProjectionHandler: Send + Sync {
    /// Name of the projection.
    fn name(&self) -> &ProjectionName;

    /// Events of `tenant` the projection consumes.
    fn selection(&self, tenant: &TenantId) -> EventQuery;

    /// Turns one stored event into row changes.
    fn handle(&self, event: &StoredEvent) -> Result<Vec<Statement>, ReduceError>;
}

/// Adapter from a typed [`Projection`] to a [`ProjectionHandler`].
#[derive(Debug)]
pub struct Projector<P> {
    projection: P,
    name: ProjectionName,
    aggregate_types: Vec<AggregateType>,
    event_types: Vec<EventType>,
}

impl<P: Projection> Projector<P> {
    /// Wraps a projection, capturing its name and event selection.
    pub fn new(projection: P) -> Self {
        let name = projection.name();
        let aggregate_types = projection.aggregate_types();
        let event_types = projection.registry().event_types();
        Self {
            projection,
            name,
            aggregate_types,
            event_types,
        }
    }

    /// The wrapped projection.
    pub const fn projection(&self) -> &P {
        &self.projection
    }
}

impl<P: Projection> ProjectionHandler for Projector<P> {
    fn name(&self) -> &ProjectionName {
        &self.name
    }

    fn selection(&self, tenant: &TenantId) -> EventQuery {
        EventQuery::tenant(tenant.clone())
            .aggregate_types(self.aggregate_types.iter().cloned())
            .event_types(self.event_types.iter().cloned())
    }

    fn handle(&self, event: &StoredEvent) -> Result<Vec<Statement>, ReduceError> {
        let decoded = self.projection.registry().decode(event)?;
        self.projection.reduce(decoded, event)
    }
}
