use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use courier_core::{MessageType, Notification, NotificationKind, ProviderDescriptor};
use serde_json::{Map, Value};

use crate::adapters::{FcmProvider, GenericHttpSmsProvider, SmtpProvider};
use crate::error::{BatchOutcome, ProviderError};

/// A configured delivery client for one external service.
///
/// Implementations must be safe for concurrent use: one instance serves all
/// in-flight deliveries for a tenant.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    async fn send(
        &self,
        record: &Notification,
        message_type: MessageType,
    ) -> Result<(), ProviderError>;

    /// Delivers a window of records in one call where the upstream API
    /// supports it. `Ok(BatchOutcome::PerItem(..))` carries per-record
    /// results; `Err` applies uniformly to the window.
    async fn send_batch(
        &self,
        records: &[Notification],
        message_type: MessageType,
    ) -> Result<BatchOutcome, ProviderError>;

    fn validate_config(&self) -> Result<(), ProviderError>;

    /// Registry type tag this instance was built from, e.g. "smtp".
    fn kind(&self) -> &str;
}

/// Factory closure: free-form config map in, live provider out. Fails with
/// `InvalidConfig` — never a partially constructed instance.
pub type ProviderFactory =
    Arc<dyn Fn(&Map<String, Value>) -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync>;

/// Name → factory table per channel.
///
/// Registration happens at startup under the write lock; lookups afterwards
/// are read-only and uncontended.
pub struct ProviderRegistry {
    factories: RwLock<HashMap<(NotificationKind, String), ProviderFactory>>,
}

impl ProviderRegistry {
    /// An empty registry with no factories.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the built-in provider types registered:
    /// email/smtp, sms/generic-http, push/fcm.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(NotificationKind::Email, "smtp", |config| {
            Ok(Arc::new(SmtpProvider::from_config(config)?) as Arc<dyn Provider>)
        });
        registry.register(NotificationKind::Sms, "generic-http", |config| {
            Ok(Arc::new(GenericHttpSmsProvider::from_config(config)?) as Arc<dyn Provider>)
        });
        registry.register(NotificationKind::Push, "fcm", |config| {
            Ok(Arc::new(FcmProvider::from_config(config)?) as Arc<dyn Provider>)
        });
        registry
    }

    /// Registers a factory for `(channel, kind)`, replacing any previous one.
    pub fn register<F>(&self, channel: NotificationKind, kind: &str, factory: F)
    where
        F: Fn(&Map<String, Value>) -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().expect("registry lock poisoned");
        factories.insert((channel, kind.to_string()), Arc::new(factory));
    }

    /// Constructs a provider instance from a descriptor.
    pub fn create(
        &self,
        channel: NotificationKind,
        descriptor: &ProviderDescriptor,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        let factory = {
            let factories = self.factories.read().expect("registry lock poisoned");
            factories.get(&(channel, descriptor.kind.clone())).cloned()
        };
        let factory = factory.ok_or_else(|| {
            ProviderError::invalid_config(format!(
                "{} provider type {:?} is not registered",
                channel.channel(),
                descriptor.kind
            ))
        })?;
        factory(&descriptor.config)
    }

    /// Registered type tags for a channel, for diagnostics.
    pub fn registered(&self, channel: NotificationKind) -> Vec<String> {
        let factories = self.factories.read().expect("registry lock poisoned");
        let mut kinds: Vec<String> = factories
            .keys()
            .filter(|(c, _)| *c == channel)
            .map(|(_, kind)| kind.clone())
            .collect();
        kinds.sort();
        kinds
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
