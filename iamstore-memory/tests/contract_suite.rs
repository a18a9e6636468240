//! Runs the backend contract suites against the in-memory store.

use iamstore_testing::contract::{
    lock_contract_tests, log_contract_tests, projection_contract_tests,
};

log_contract_tests! {
    suite = in_memory_log,
    make_store = iamstore_memory::InMemoryStore::new,
}

projection_contract_tests! {
    suite = in_memory_projection,
    make_store = iamstore_memory::InMemoryStore::new,
}

lock_contract_tests! {
    suite = in_memory_lock,
    make_store = iamstore_memory::InMemoryStore::new,
}
