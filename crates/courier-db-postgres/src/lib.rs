//! PostgreSQL storage backend for courier.
//!
//! Implements `NotificationStore` and `PartnerConfigStore` over sqlx. The
//! schema is bootstrapped lazily on first use; the scheduler claim is a
//! conditional `UPDATE ... WHERE status = 'PENDING'` so concurrent replicas
//! cannot both take ownership of a due record.

mod config;
mod store;

pub use config::PostgresConfig;
pub use store::{PostgresConfigStore, PostgresNotificationStore};
