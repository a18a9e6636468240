//! Shared validation predicates for domain types.
//!
//! This module contains validation functions used by nutype-based domain types
//! across the iamstore crates.

/// Validation predicate: dotted lowercase identifier.
///
/// Aggregate and event types are namespaced tags such as `user.human.added`.
/// Every dot-separated segment must start with a lowercase ASCII letter and may
/// continue with lowercase letters, digits, `_` or `-`.
pub(crate) fn is_dotted_identifier(s: &str) -> bool {
    s.split('.').all(|segment| {
        let mut chars = segment.chars();
        matches!(chars.next(), Some(first) if first.is_ascii_lowercase())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    })
}

/// Validation predicate: lowercase SQL identifier.
///
/// Projection names double as table names in relational backends, so they are
/// restricted to `[a-z][a-z0-9_]*`.
pub(crate) fn is_sql_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Validation predicate: reject ASCII control characters.
pub(crate) fn has_no_control_characters(s: &str) -> bool {
    !s.chars().any(char::is_control)
}
