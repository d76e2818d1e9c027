//! HTTP façade and process wiring for courier.
//!
//! The binary assembles the pipeline explicitly: stores, provider registry
//! and managers, coordinator, batching dispatcher, bus consumers, and the
//! scheduler, then serves the REST API in front of them.

pub mod config;
pub mod handlers;
pub mod observability;
pub mod server;

pub use config::{AppConfig, BusConfig, DispatchConfig, ServerConfig, StorageBackend, StorageConfig};
pub use observability::{init_tracing, shutdown_tracing};
pub use server::{AppState, CourierServer, build_app};
