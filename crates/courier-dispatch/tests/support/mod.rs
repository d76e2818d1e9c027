//! Shared test harness: in-memory stores and bus, scriptable mock
//! providers, and a fully wired pipeline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_bus::InMemoryBus;
use courier_core::{
    BatchConfig, MessageType, Notification, NotificationKind, NotificationRequest, PartnerConfig,
    ProviderDescriptor,
};
use courier_db_memory::{InMemoryConfigStore, InMemoryNotificationStore};
use courier_dispatch::{BatchingDispatcher, Coordinator, DispatchSettings};
use courier_providers::{BatchOutcome, Provider, ProviderError, ProviderManager, ProviderRegistry};
use courier_storage::{NotificationStore, PartnerConfigStore};
use tokio::sync::watch;

/// Scripted outcome for one delivery attempt to an address.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    Deliver,
    Transient,
    Permanent,
}

/// Shared recording state behind every mock provider instance of one
/// channel. Outcomes are scripted per address and consumed in order; an
/// unscripted attempt succeeds.
#[derive(Default, Debug)]
pub struct MockState {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    send_calls: Mutex<Vec<(String, MessageType)>>,
    batch_calls: Mutex<Vec<Vec<String>>>,
}

impl MockState {
    pub fn script(&self, address: &str, outcomes: &[Script]) {
        self.scripts
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .extend(outcomes.iter().copied());
    }

    fn next_outcome(&self, address: &str) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(address)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Script::Deliver)
    }

    pub fn send_count(&self) -> usize {
        self.send_calls.lock().unwrap().len()
    }

    pub fn send_calls(&self) -> Vec<(String, MessageType)> {
        self.send_calls.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_calls.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn batch_calls(&self) -> Vec<Vec<String>> {
        self.batch_calls.lock().unwrap().clone()
    }

    /// How many times an address was attempted across single and batch
    /// sends.
    pub fn attempts_for(&self, address: &str) -> usize {
        let singles = self
            .send_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == address)
            .count();
        let batched = self
            .batch_calls
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .filter(|a| *a == address)
            .count();
        singles + batched
    }
}

#[derive(Debug)]
struct MockProvider {
    state: Arc<MockState>,
}

fn outcome_to_result(script: Script) -> Result<(), ProviderError> {
    match script {
        Script::Deliver => Ok(()),
        Script::Transient => Err(ProviderError::transient("scripted transient failure")),
        Script::Permanent => Err(ProviderError::permanent("scripted permanent failure")),
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn send(
        &self,
        record: &Notification,
        message_type: MessageType,
    ) -> Result<(), ProviderError> {
        self.state
            .send_calls
            .lock()
            .unwrap()
            .push((record.address.clone(), message_type));
        outcome_to_result(self.state.next_outcome(&record.address))
    }

    async fn send_batch(
        &self,
        records: &[Notification],
        _message_type: MessageType,
    ) -> Result<BatchOutcome, ProviderError> {
        self.state
            .batch_calls
            .lock()
            .unwrap()
            .push(records.iter().map(|r| r.address.clone()).collect());
        Ok(BatchOutcome::PerItem(
            records
                .iter()
                .map(|r| outcome_to_result(self.state.next_outcome(&r.address)))
                .collect(),
        ))
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn kind(&self) -> &str {
        "mock"
    }
}

/// A fully wired pipeline over in-memory backends.
pub struct Harness {
    pub store: Arc<InMemoryNotificationStore>,
    pub config_store: Arc<InMemoryConfigStore>,
    pub coordinator: Arc<Coordinator>,
    pub dispatcher: Arc<BatchingDispatcher>,
    pub bus: Arc<InMemoryBus>,
    pub email: Arc<MockState>,
    pub email_alt: Arc<MockState>,
    pub sms: Arc<MockState>,
    pub push: Arc<MockState>,
    pub email_factory_calls: Arc<AtomicUsize>,
    pub shutdown_tx: watch::Sender<bool>,
}

pub fn harness() -> Harness {
    harness_with(DispatchSettings::default())
}

pub fn harness_with(settings: DispatchSettings) -> Harness {
    let store = Arc::new(InMemoryNotificationStore::new());
    let config_store = Arc::new(InMemoryConfigStore::new());
    let bus = Arc::new(InMemoryBus::new());

    let email = Arc::new(MockState::default());
    let email_alt = Arc::new(MockState::default());
    let sms = Arc::new(MockState::default());
    let push = Arc::new(MockState::default());
    let email_factory_calls = Arc::new(AtomicUsize::new(0));

    let registry = Arc::new(ProviderRegistry::new());
    {
        let state = email.clone();
        let calls = email_factory_calls.clone();
        registry.register(NotificationKind::Email, "mock", move |_config| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockProvider { state: state.clone() }) as Arc<dyn Provider>)
        });
    }
    {
        let state = email_alt.clone();
        registry.register(NotificationKind::Email, "mock-alt", move |_config| {
            Ok(Arc::new(MockProvider { state: state.clone() }) as Arc<dyn Provider>)
        });
    }
    {
        let state = sms.clone();
        registry.register(NotificationKind::Sms, "mock", move |_config| {
            Ok(Arc::new(MockProvider { state: state.clone() }) as Arc<dyn Provider>)
        });
    }
    {
        let state = push.clone();
        registry.register(NotificationKind::Push, "mock", move |_config| {
            Ok(Arc::new(MockProvider { state: state.clone() }) as Arc<dyn Provider>)
        });
    }

    let email_manager = Arc::new(ProviderManager::new(
        NotificationKind::Email,
        registry.clone(),
        config_store.clone(),
    ));
    let sms_manager = Arc::new(ProviderManager::new(
        NotificationKind::Sms,
        registry.clone(),
        config_store.clone(),
    ));
    let push_manager = Arc::new(ProviderManager::new(
        NotificationKind::Push,
        registry,
        config_store.clone(),
    ));

    let coordinator = Coordinator::new(
        store.clone(),
        config_store.clone(),
        email_manager,
        sms_manager,
        push_manager,
        settings,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = Arc::new(BatchingDispatcher::new(
        coordinator.clone(),
        config_store.clone(),
        shutdown_rx,
    ));

    Harness {
        store,
        config_store,
        coordinator,
        dispatcher,
        bus,
        email,
        email_alt,
        sms,
        push,
        email_factory_calls,
        shutdown_tx,
    }
}

pub fn mock_descriptor(name: &str, kind: &str, priority: i32, enabled: bool) -> ProviderDescriptor {
    ProviderDescriptor {
        name: name.into(),
        kind: kind.into(),
        priority,
        enabled,
        config: serde_json::Map::new(),
    }
}

impl Harness {
    /// Stores a tenant config with a mock provider on every channel.
    pub async fn seed_tenant(&self, tenant_id: i64, batch: BatchConfig) -> PartnerConfig {
        let mut config = PartnerConfig::new(tenant_id);
        config.batch_config = batch;
        config.email_providers = vec![mock_descriptor("email-mock", "mock", 1, true)];
        config.sms_providers = vec![mock_descriptor("sms-mock", "mock", 1, true)];
        config.push_providers = vec![mock_descriptor("push-mock", "mock", 1, true)];
        self.config_store.save(&config).await.unwrap()
    }

    pub async fn seed_config(&self, config: PartnerConfig) -> PartnerConfig {
        self.config_store.save(&config).await.unwrap()
    }

    pub fn request(
        &self,
        tenant_id: i64,
        kind: NotificationKind,
        recipients: &[&str],
    ) -> NotificationRequest {
        NotificationRequest {
            tenant_id,
            kind,
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            body: "hello".into(),
            headline: Some("headline".into()),
            from: None,
            reply_to: None,
            tag: None,
            schedule_ts: None,
            message_type: MessageType::System,
            data: None,
            request_id: None,
            batch_id: Some(uuid::Uuid::new_v4().to_string()),
            meta: None,
        }
    }

    /// Polls until every record of the batch reaches a terminal status.
    pub async fn wait_batch_settled(&self, batch_id: &str, expected: usize) -> Vec<Notification> {
        for _ in 0..600 {
            let records = self.store.get_by_batch_id(batch_id).await.unwrap();
            if records.len() == expected && records.iter().all(|r| r.status.is_terminal()) {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("batch {batch_id} did not settle");
    }
}
