//! Event type registry mapping type tags to decoders.
//!
//! A registry is built once when a projection is constructed and never changes
//! afterwards. Decoding looks up the stored event's type tag and hands the
//! payload to the decoder registered for it, producing the projection's event
//! sum type.

use iamstore_types::{EventType, StoredEvent};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Error types specific to the event registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A tag passed to the builder is not a valid event type.
    #[error("invalid event type tag '{tag}': {detail}")]
    InvalidEventType {
        /// The rejected tag.
        tag: String,
        /// Validation message.
        detail: String,
    },

    /// A tag was registered twice.
    #[error("event type '{event_type}' is already registered")]
    DuplicateEventType {
        /// The conflicting tag.
        event_type: EventType,
    },

    /// A stored event carries a tag without a decoder.
    #[error("unknown event type: {event_type}")]
    UnknownEventType {
        /// The unregistered tag.
        event_type: EventType,
    },

    /// The payload did not match the registered shape.
    #[error("failed to decode event of type '{event_type}': {detail}")]
    DecodeFailed {
        /// Tag of the event.
        event_type: EventType,
        /// Deserializer message.
        detail: String,
    },
}

type Decoder<E> = Box<dyn Fn(Value) -> Result<E, serde_json::Error> + Send + Sync>;

/// Read-only lookup table from event type tag to decoder.
pub struct EventRegistry<E> {
    decoders: BTreeMap<EventType, Decoder<E>>,
}

impl<E> EventRegistry<E> {
    /// Starts building a registry.
    pub fn builder() -> EventRegistryBuilder<E> {
        EventRegistryBuilder {
            decoders: BTreeMap::new(),
        }
    }

    /// Decodes a stored event into the registry's event type.
    pub fn decode(&self, event: &StoredEvent) -> Result<E, RegistryError> {
        let decoder =
            self.decoders
                .get(&event.event_type)
                .ok_or_else(|| RegistryError::UnknownEventType {
                    event_type: event.event_type.clone(),
                })?;

        decoder(event.payload.clone()).map_err(|error| RegistryError::DecodeFailed {
            event_type: event.event_type.clone(),
            detail: error.to_string(),
        })
    }

    /// Returns true if `event_type` has a decoder.
    pub fn contains(&self, event_type: &EventType) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Registered tags in ascending order.
    pub fn event_types(&self) -> Vec<EventType> {
        self.decoders.keys().cloned().collect()
    }
}

impl<E> fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("event_types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`EventRegistry`].
pub struct EventRegistryBuilder<E> {
    decoders: BTreeMap<EventType, Decoder<E>>,
}

impl<E: 'static> EventRegistryBuilder<E> {
    /// Registers a tag whose payload deserializes into `T`, wrapped into the
    /// sum type by `variant`.
    ///
    /// ```ignore
    /// let registry = EventRegistry::builder()
    ///     .register("user.added", UserEvent::Added)?
    ///     .register("user.renamed", UserEvent::Renamed)?
    ///     .build();
    /// ```
    pub fn register<T>(self, tag: &str, variant: fn(T) -> E) -> Result<Self, RegistryError>
    where
        T: DeserializeOwned + 'static,
    {
        self.register_with(tag, move |payload| {
            serde_json::from_value::<T>(payload).map(variant)
        })
    }

    /// Registers a tag whose payload carries no information.
    pub fn register_unit(self, tag: &str, event: fn() -> E) -> Result<Self, RegistryError> {
        self.register_with(tag, move |_| Ok(event()))
    }

    /// Registers a tag with a custom decoder.
    pub fn register_with<F>(mut self, tag: &str, decoder: F) -> Result<Self, RegistryError>
    where
        F: Fn(Value) -> Result<E, serde_json::Error> + Send + Sync + 'static,
    {
        let event_type =
            EventType::try_new(tag).map_err(|error| RegistryError::InvalidEventType {
                tag: tag.to_string(),
                detail: error.to_string(),
            })?;

        if self.decoders.contains_key(&event_type) {
            return Err(RegistryError::DuplicateEventType { event_type });
        }

        let _ = self.decoders.insert(event_type, Box::new(decoder));
        Ok(self)
    }

    /// Finalizes the registry.
    pub fn build(self) -> EventRegistry<E> {
        EventRegistry {
            decoders: self.decoders,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use iamstore_types::{
        AggregateId, AggregateType, AggregateVersion, EditorId, ResourceOwner, Sequence, TenantId,
    };
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Added {
        name: String,
    }

    #[derive(Debug, PartialEq)]
    enum UserEvent {
        Added(Added),
        Removed,
    }

    fn registry() -> EventRegistry<UserEvent> {
        EventRegistry::builder()
            .register("user.added", UserEvent::Added)
            .and_then(|builder| builder.register_unit("user.removed", || UserEvent::Removed))
            .expect("valid registry")
            .build()
    }

    fn stored(event_type: &str, payload: Value) -> StoredEvent {
        StoredEvent {
            tenant: TenantId::try_new("tenant-1").unwrap(),
            aggregate_type: AggregateType::try_new("user").unwrap(),
            aggregate_id: AggregateId::try_new("user-1").unwrap(),
            aggregate_version: AggregateVersion::new(1),
            sequence: Sequence::new(1),
            event_type: EventType::try_new(event_type).unwrap(),
            payload,
            created_at: Utc::now(),
            editor: EditorId::try_new("admin").unwrap(),
            resource_owner: ResourceOwner::try_new("org-1").unwrap(),
        }
    }

    #[test]
    fn decodes_registered_variants() {
        let registry = registry();

        assert_eq!(
            registry.decode(&stored("user.added", json!({ "name": "alice" }))),
            Ok(UserEvent::Added(Added {
                name: "alice".to_string()
            }))
        );
        assert_eq!(
            registry.decode(&stored("user.removed", json!(null))),
            Ok(UserEvent::Removed)
        );
    }

    #[test]
    fn unknown_tags_are_reported() {
        let error = registry()
            .decode(&stored("user.locked", json!({})))
            .expect_err("tag is not registered");

        assert!(matches!(error, RegistryError::UnknownEventType { .. }));
    }

    #[test]
    fn malformed_payloads_are_reported() {
        let error = registry()
            .decode(&stored("user.added", json!({ "nom": "alice" })))
            .expect_err("payload misses name");

        assert!(matches!(error, RegistryError::DecodeFailed { .. }));
    }

    #[test]
    fn duplicate_tags_are_rejected() {
        let result = EventRegistry::<UserEvent>::builder()
            .register_unit("user.removed", || UserEvent::Removed)
            .and_then(|builder| builder.register_unit("user.removed", || UserEvent::Removed));

        assert!(matches!(
            result,
            Err(RegistryError::DuplicateEventType { .. })
        ));
    }

    #[test]
    fn invalid_tags_are_rejected() {
        let result =
            EventRegistry::<UserEvent>::builder().register_unit("UserRemoved", || UserEvent::Removed);

        assert!(matches!(result, Err(RegistryError::InvalidEventType { .. })));
    }

    #[test]
    fn event_types_are_sorted() {
        let names: Vec<String> = registry()
            .event_types()
            .into_iter()
            .map(|event_type| event_type.to_string())
            .collect();

        assert_eq!(names, vec!["user.added", "user.removed"]);
    }
}
