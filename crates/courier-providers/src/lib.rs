//! Provider layer for courier: the registry of provider factories, the
//! per-tenant provider manager, and the built-in delivery adapters.
//!
//! A provider is an opaque, internally thread-safe client for one external
//! delivery service. The registry maps `(channel, type)` to a factory; the
//! manager resolves and caches one live provider per tenant and channel,
//! following the priority order in the tenant's partner config.

pub mod adapters;
pub mod error;
pub mod manager;
pub mod registry;

pub use adapters::{FcmProvider, GenericHttpSmsProvider, SmtpProvider};
pub use error::{BatchOutcome, ProviderError};
pub use manager::ProviderManager;
pub use registry::{Provider, ProviderFactory, ProviderRegistry};
