//! Events as they are written to and read from the log.

use crate::ids::{
    AggregateId, AggregateType, AggregateVersion, EditorId, EventType, ResourceOwner, Sequence,
    TenantId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A typed domain event that can be appended to the log.
///
/// Domain events are sum types (one enum variant per event type). The type tag
/// is stored next to the payload so readers can pick a decoder without
/// inspecting the payload itself.
pub trait DomainEvent: Send + Sync {
    /// Type tag stored alongside the payload.
    fn event_type(&self) -> EventType;

    /// Serialized payload for this event (without the type tag).
    fn payload(&self) -> serde_json::Result<Value>;
}

/// Reference to the aggregate an append targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRef {
    /// Kind of aggregate.
    pub aggregate_type: AggregateType,
    /// Aggregate instance.
    pub aggregate_id: AggregateId,
    /// Organization that owns the aggregate.
    pub resource_owner: ResourceOwner,
}

impl AggregateRef {
    /// Creates a new aggregate reference.
    pub const fn new(
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        resource_owner: ResourceOwner,
    ) -> Self {
        Self {
            aggregate_type,
            aggregate_id,
            resource_owner,
        }
    }
}

/// An event that has not been committed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// Type tag of the event.
    pub event_type: EventType,
    /// Serialized payload.
    pub payload: Value,
    /// Principal that caused the event.
    pub editor: EditorId,
}

/// An immutable, committed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Tenant the event belongs to.
    pub tenant: TenantId,
    /// Kind of aggregate the event was appended to.
    pub aggregate_type: AggregateType,
    /// Aggregate instance the event was appended to.
    pub aggregate_id: AggregateId,
    /// Position of the event within its aggregate (starts at 1).
    pub aggregate_version: AggregateVersion,
    /// Position of the event within its tenant (starts at 1).
    pub sequence: Sequence,
    /// Type tag of the event.
    pub event_type: EventType,
    /// Serialized payload.
    pub payload: Value,
    /// Commit timestamp.
    pub created_at: DateTime<Utc>,
    /// Principal that caused the event.
    pub editor: EditorId,
    /// Organization owning the aggregate.
    pub resource_owner: ResourceOwner,
}

impl StoredEvent {
    /// Returns the aggregate this event belongs to.
    pub fn aggregate(&self) -> AggregateRef {
        AggregateRef::new(
            self.aggregate_type.clone(),
            self.aggregate_id.clone(),
            self.resource_owner.clone(),
        )
    }
}
