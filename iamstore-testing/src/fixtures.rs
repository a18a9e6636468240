//! Fixture builders.
//!
//! Identifiers that scope data (tenants, projections, lock keys) carry a
//! UUIDv7 suffix so tests running in parallel against a shared database never
//! see each other's rows.

use iamstore_types::{
    AggregateId, AggregateRef, AggregateType, ConstraintField, ConstraintType, EditorId,
    EntityId, EventType, LockKey, OwnerId, PendingEvent, ProjectionName, ResourceOwner,
    TenantId, UniqueConstraint,
};
use serde_json::Value;
use uuid::Uuid;

fn unique(label: &str) -> String {
    format!("{label}_{}", Uuid::now_v7().simple())
}

/// A tenant no other test uses.
pub fn tenant(label: &str) -> TenantId {
    TenantId::try_new(unique(label)).expect("valid tenant id")
}

/// A fresh aggregate of `aggregate_type` owned by `org-1`.
pub fn aggregate(aggregate_type: &str) -> AggregateRef {
    AggregateRef::new(
        AggregateType::try_new(aggregate_type).expect("valid aggregate type"),
        AggregateId::generate(),
        ResourceOwner::try_new("org-1").expect("valid resource owner"),
    )
}

/// A fresh `user` aggregate.
pub fn user() -> AggregateRef {
    aggregate("user")
}

/// The principal recorded on fixture events.
pub fn editor() -> EditorId {
    EditorId::try_new("system").expect("valid editor id")
}

/// Event type from a literal tag.
pub fn event_type(tag: &str) -> EventType {
    EventType::try_new(tag).expect("valid event type")
}

/// An untyped pending event.
pub fn pending(tag: &str, payload: Value) -> PendingEvent {
    PendingEvent {
        event_type: event_type(tag),
        payload,
        editor: editor(),
    }
}

/// Unique constraint on login names, the canonical example.
pub fn login_name(value: &str) -> UniqueConstraint {
    UniqueConstraint::new(
        ConstraintType::try_new("login_name").expect("valid constraint type"),
        ConstraintField::try_new(value).expect("valid constraint field"),
    )
}

/// A projection name no other test uses.
pub fn projection(label: &str) -> ProjectionName {
    ProjectionName::try_new(unique(label)).expect("valid projection name")
}

/// Entity id from a literal.
pub fn entity(id: &str) -> EntityId {
    EntityId::try_new(id).expect("valid entity id")
}

/// A lock key no other test uses.
pub fn lock_key(label: &str) -> LockKey {
    LockKey::try_new(unique(label)).expect("valid lock key")
}

/// A fresh lock owner.
pub fn owner() -> OwnerId {
    OwnerId::generate()
}
