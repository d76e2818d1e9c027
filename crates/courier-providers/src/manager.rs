use std::sync::Arc;

use courier_core::{NotificationKind, PartnerConfig};
use courier_storage::{DynPartnerConfigStore, PartnerConfigStore};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::registry::{Provider, ProviderRegistry};

#[derive(Clone)]
struct CacheEntry {
    version: i64,
    provider: Arc<dyn Provider>,
}

/// Per-tenant provider cache for one channel.
///
/// One instance serves email, another sms, another push; they differ only in
/// which descriptor list they read off the partner config. A cached instance
/// is valid while the tenant's config version is unchanged; config writes
/// bump the version, so the next `get` rebuilds from the new descriptors.
pub struct ProviderManager {
    channel: NotificationKind,
    registry: Arc<ProviderRegistry>,
    config_store: DynPartnerConfigStore,
    cache: DashMap<i64, CacheEntry>,
    inflight: DashMap<i64, Arc<Mutex<()>>>,
}

impl ProviderManager {
    pub fn new(
        channel: NotificationKind,
        registry: Arc<ProviderRegistry>,
        config_store: DynPartnerConfigStore,
    ) -> Self {
        Self {
            channel,
            registry,
            config_store,
            cache: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    pub fn channel(&self) -> NotificationKind {
        self.channel
    }

    /// Resolves the live provider for a tenant, constructing and caching it
    /// on first use. Concurrent cold lookups for one tenant invoke the
    /// factory exactly once.
    pub async fn get(&self, tenant_id: i64) -> Result<Arc<dyn Provider>, ProviderError> {
        let current_version = match self.config_store.version_of(tenant_id).await {
            Ok(version) => version,
            Err(err) if err.is_not_found() => {
                return Err(ProviderError::ConfigMissing { tenant_id });
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(entry) = self.cache.get(&tenant_id)
            && entry.version == current_version
        {
            return Ok(entry.provider.clone());
        }

        let gate = self
            .inflight
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // Another caller may have built the provider while we waited.
        if let Some(entry) = self.cache.get(&tenant_id)
            && entry.version == current_version
        {
            return Ok(entry.provider.clone());
        }

        let config = match self.config_store.get_by_tenant(tenant_id).await {
            Ok(config) => config,
            Err(err) if err.is_not_found() => {
                return Err(ProviderError::ConfigMissing { tenant_id });
            }
            Err(err) => return Err(err.into()),
        };

        let provider = self.build(&config)?;
        self.cache.insert(
            tenant_id,
            CacheEntry {
                version: config.version,
                provider: provider.clone(),
            },
        );
        debug!(
            tenant_id,
            channel = self.channel.channel(),
            version = config.version,
            kind = provider.kind(),
            "Cached provider instance"
        );
        Ok(provider)
    }

    /// Drops the cached instance for a tenant; the next `get` rebuilds.
    pub fn invalidate(&self, tenant_id: i64) {
        self.cache.remove(&tenant_id);
    }

    fn build(&self, config: &PartnerConfig) -> Result<Arc<dyn Provider>, ProviderError> {
        let descriptors = config.providers_for(self.channel);
        let mut ordered: Vec<_> = descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| d.enabled)
            .collect();
        ordered.sort_by_key(|(index, d)| (d.priority, *index));

        if ordered.is_empty() {
            return Err(ProviderError::NoProvider {
                tenant_id: config.tenant_id,
                channel: self.channel.channel(),
            });
        }

        let mut last_error = None;
        for (_, descriptor) in ordered {
            match self.registry.create(self.channel, descriptor) {
                Ok(provider) => return Ok(provider),
                Err(err) => {
                    warn!(
                        tenant_id = config.tenant_id,
                        channel = self.channel.channel(),
                        provider = %descriptor.name,
                        error = %err,
                        "Provider construction failed, trying next descriptor"
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(ProviderError::NoProvider {
            tenant_id: config.tenant_id,
            channel: self.channel.channel(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_core::{MessageType, Notification, ProviderDescriptor};
    use courier_db_memory::InMemoryConfigStore;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::BatchOutcome;

    #[derive(Debug)]
    struct StubProvider {
        name: String,
    }

    #[async_trait]
    impl Provider for StubProvider {
        async fn send(
            &self,
            _record: &Notification,
            _message_type: MessageType,
        ) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn send_batch(
            &self,
            records: &[Notification],
            _message_type: MessageType,
        ) -> Result<BatchOutcome, ProviderError> {
            Ok(BatchOutcome::PerItem(records.iter().map(|_| Ok(())).collect()))
        }

        fn validate_config(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        fn kind(&self) -> &str {
            &self.name
        }
    }

    fn descriptor(name: &str, kind: &str, priority: i32, enabled: bool) -> ProviderDescriptor {
        ProviderDescriptor {
            name: name.into(),
            kind: kind.into(),
            priority,
            enabled,
            config: Map::new(),
        }
    }

    fn counting_registry(kind: &'static str, counter: Arc<AtomicUsize>) -> Arc<ProviderRegistry> {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(NotificationKind::Email, kind, move |_config| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubProvider { name: kind.into() }) as Arc<dyn Provider>)
        });
        registry
    }

    async fn seed_config(store: &InMemoryConfigStore, descriptors: Vec<ProviderDescriptor>) {
        let mut config = courier_core::PartnerConfig::new(1001);
        config.email_providers = descriptors;
        store.save(&config).await.unwrap();
    }

    #[tokio::test]
    async fn cold_cache_burst_invokes_factory_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry("stub", counter.clone());
        let store = Arc::new(InMemoryConfigStore::new());
        seed_config(&store, vec![descriptor("primary", "stub", 1, true)]).await;

        let manager = Arc::new(ProviderManager::new(
            NotificationKind::Email,
            registry,
            store,
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.get(1001).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_enabled_descriptor_never_calls_factory() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry("stub", counter.clone());
        let store = Arc::new(InMemoryConfigStore::new());
        seed_config(&store, vec![descriptor("off", "stub", 1, false)]).await;

        let manager = ProviderManager::new(NotificationKind::Email, registry, store);
        let err = manager.get(1001).await.unwrap_err();
        assert!(matches!(err, ProviderError::NoProvider { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_config_is_reported() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry("stub", counter.clone());
        let store = Arc::new(InMemoryConfigStore::new());
        let manager = ProviderManager::new(NotificationKind::Email, registry, store);
        let err = manager.get(4040).await.unwrap_err();
        assert!(matches!(err, ProviderError::ConfigMissing { tenant_id: 4040 }));
    }

    #[tokio::test]
    async fn config_update_swaps_cached_provider() {
        let registry = Arc::new(ProviderRegistry::new());
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        {
            let a_calls = a_calls.clone();
            registry.register(NotificationKind::Email, "provider-a", move |_| {
                a_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(StubProvider { name: "provider-a".into() }) as Arc<dyn Provider>)
            });
        }
        {
            let b_calls = b_calls.clone();
            registry.register(NotificationKind::Email, "provider-b", move |_| {
                b_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(StubProvider { name: "provider-b".into() }) as Arc<dyn Provider>)
            });
        }

        let store = Arc::new(InMemoryConfigStore::new());
        let mut config = courier_core::PartnerConfig::new(1001);
        config.email_providers = vec![
            descriptor("a", "provider-a", 1, true),
            descriptor("b", "provider-b", 2, false),
        ];
        let stored = store.save(&config).await.unwrap();

        let manager = ProviderManager::new(NotificationKind::Email, registry, store.clone());
        assert_eq!(manager.get(1001).await.unwrap().kind(), "provider-a");
        // cached: repeat lookups do not rebuild
        assert_eq!(manager.get(1001).await.unwrap().kind(), "provider-a");
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);

        // disable A, enable B; the version bump invalidates the cache
        let mut updated = stored.clone();
        updated.email_providers[0].enabled = false;
        updated.email_providers[1].enabled = true;
        store.save(&updated).await.unwrap();

        assert_eq!(manager.get(1001).await.unwrap().kind(), "provider-b");
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broken_descriptor_falls_back_to_next() {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(NotificationKind::Email, "broken", |_| {
            Err(ProviderError::invalid_config("bad settings"))
        });
        let good_calls = Arc::new(AtomicUsize::new(0));
        {
            let good_calls = good_calls.clone();
            registry.register(NotificationKind::Email, "good", move |_| {
                good_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(StubProvider { name: "good".into() }) as Arc<dyn Provider>)
            });
        }

        let store = Arc::new(InMemoryConfigStore::new());
        seed_config(
            &store,
            vec![
                descriptor("primary", "broken", 1, true),
                descriptor("fallback", "good", 2, true),
            ],
        )
        .await;

        let manager = ProviderManager::new(NotificationKind::Email, registry, store);
        assert_eq!(manager.get(1001).await.unwrap().kind(), "good");
        assert_eq!(good_calls.load(Ordering::SeqCst), 1);
    }
}
