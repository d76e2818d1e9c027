//! Storage abstraction for the courier notification dispatch engine.
//!
//! The traits here are the record store gateway: typed CRUD over
//! notifications and partner configs, with the query predicates the
//! scheduler and status endpoints need. Backends live in
//! `courier-db-postgres` and `courier-db-memory`.

pub mod error;
pub mod retry;
pub mod traits;

pub use error::{ErrorCategory, StorageError};
pub use retry::{RetryPolicy, with_retries};
pub use traits::{DynNotificationStore, DynPartnerConfigStore, NotificationStore, PartnerConfigStore};
