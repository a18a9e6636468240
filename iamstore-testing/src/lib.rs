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
#![allow(clippy::missing_panics_doc, clippy::too_many_lines)]

//! Test support for IAMStore backends.
//!
//! - [`contract`]: backend-agnostic behavioral suites. Every storage adapter
//!   instantiates them with [`log_contract_tests!`], [`projection_contract_tests!`]
//!   and [`lock_contract_tests!`].
//! - [`fixtures`]: identifiers and events that are unique per call, so suites
//!   can share one database between parallel tests.

pub mod contract;
pub mod fixtures;
