//! Validated identifier and position types.
//!
//! All identifiers use smart constructors so that a value, once built, never
//! needs to be checked again.

use crate::validation::{has_no_control_characters, is_dotted_identifier, is_sql_identifier};
use nutype::nutype;
use uuid::Uuid;

/// Tenant (instance) identifier. Every event, constraint, projection row and
/// sequence is scoped to exactly one tenant.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200, predicate = has_no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct TenantId(String);

/// Kind of aggregate, e.g. `user`, `org`, `key_pair`.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 100, predicate = is_dotted_identifier),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateType(String);

/// Identifier of one aggregate instance within a tenant.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200, predicate = has_no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateId(String);

impl AggregateId {
    /// Generates a fresh, time-ordered aggregate identifier.
    pub fn generate() -> Self {
        Self::generated(Uuid::now_v7())
    }

    fn generated(id: Uuid) -> Self {
        // A hyphenated UUID is never empty, never too long and has no control characters.
        match Self::try_new(id.to_string()) {
            Ok(aggregate_id) => aggregate_id,
            Err(_) => unreachable!("uuid renders as a valid aggregate id"),
        }
    }
}

/// Type tag of an event, e.g. `user.human.added`.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200, predicate = is_dotted_identifier),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventType(String);

/// Organization owning the aggregate an event belongs to.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200, predicate = has_no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ResourceOwner(String);

/// User or system principal that caused an event.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200, predicate = has_no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EditorId(String);

/// Category of a unique constraint, e.g. `login_name` or `org_domain`.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 100, predicate = is_dotted_identifier),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ConstraintType(String);

/// The value claimed by a unique constraint. Compared exactly as given; callers
/// normalize (e.g. lowercase a login name) before building it.
#[nutype(
    validate(not_empty, len_char_max = 500),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ConstraintField(String);

/// Name of a projection (materialized view). Restricted to a lowercase SQL
/// identifier because relational backends derive a table name from it.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 63, predicate = is_sql_identifier),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProjectionName(String);

/// Key of one row in a projection, unique per (projection, tenant).
#[nutype(
    validate(not_empty, len_char_max = 200),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EntityId(String);

impl From<&AggregateId> for EntityId {
    fn from(aggregate_id: &AggregateId) -> Self {
        match Self::try_new(aggregate_id.to_string()) {
            Ok(entity_id) => entity_id,
            Err(_) => unreachable!("aggregate id constraints are stricter than entity id"),
        }
    }
}

/// Per-tenant position of an event in the log. Zero means "nothing yet".
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize
))]
pub struct Sequence(u64);

impl Sequence {
    /// The position before the first event of a tenant.
    pub fn zero() -> Self {
        Self::new(0)
    }

    /// The position directly after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner() + 1)
    }
}

/// Per-aggregate version. Zero means the aggregate has no events yet.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize
))]
pub struct AggregateVersion(u64);

impl AggregateVersion {
    /// Version of an aggregate that has never been written.
    pub fn initial() -> Self {
        Self::new(0)
    }

    /// Increment the version by 1.
    #[must_use]
    pub fn increment(self) -> Self {
        Self::new(self.into_inner() + 1)
    }
}

/// Name of a lockable resource, e.g. `signing_key:tenant-1`.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200, predicate = has_no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct LockKey(String);

/// Identity of a running service instance competing for locks.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200, predicate = has_no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct OwnerId(String);

impl OwnerId {
    /// Generates a unique owner id for this process.
    pub fn generate() -> Self {
        match Self::try_new(Uuid::now_v7().to_string()) {
            Ok(owner) => owner,
            Err(_) => unreachable!("uuid renders as a valid owner id"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn tenant_id_trims_whitespace(s in " {0,10}[a-zA-Z0-9_-]{1,100} {0,10}") {
            let tenant = TenantId::try_new(s.clone()).unwrap();
            prop_assert_eq!(tenant.as_ref(), s.trim());
        }

        #[test]
        fn tenant_id_rejects_blank_strings(s in " {0,50}") {
            prop_assert!(TenantId::try_new(s).is_err());
        }

        #[test]
        fn sequence_next_increments_by_one(v in 0u64..u64::MAX) {
            prop_assert_eq!(Sequence::new(v).next().into_inner(), v + 1);
        }

        #[test]
        fn sequence_ordering_matches_inner(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(Sequence::new(a) < Sequence::new(b), a < b);
        }
    }

    #[test]
    fn projection_name_rejects_sql_metacharacters() {
        assert!(ProjectionName::try_new("users; drop table events").is_err());
        assert!(ProjectionName::try_new("Users").is_err());
        assert!(ProjectionName::try_new("users_v2").is_ok());
    }

    #[test]
    fn event_type_requires_dotted_lowercase() {
        assert!(EventType::try_new("user.human.added").is_ok());
        assert!(EventType::try_new("UserAdded").is_err());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(AggregateId::generate(), AggregateId::generate());
        assert_ne!(OwnerId::generate(), OwnerId::generate());
    }

    #[test]
    fn entity_id_from_aggregate_id_keeps_value() {
        let aggregate_id = AggregateId::try_new("user-1").unwrap();
        assert_eq!(EntityId::from(&aggregate_id).as_ref(), "user-1");
    }

    #[test]
    fn aggregate_version_increment_adds_one() {
        assert_eq!(
            AggregateVersion::new(5).increment(),
            AggregateVersion::new(6)
        );
    }
}
