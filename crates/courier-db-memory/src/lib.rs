//! In-memory storage backend for courier.
//!
//! Implements the `courier-storage` traits over DashMap. Used by the test
//! suites and by `storage.backend = "memory"` local runs; it mirrors the
//! semantics of the PostgreSQL backend, including the conditional scheduler
//! claim.

mod store;

pub use store::{InMemoryConfigStore, InMemoryNotificationStore};
