use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use courier_core::{Notification, NotificationRequest, NotificationStatus, PartnerConfig};
use courier_storage::{NotificationStore, PartnerConfigStore, StorageError, traits::build_record_meta};
use dashmap::DashMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// DashMap-backed notification store.
#[derive(Clone, Default)]
pub struct InMemoryNotificationStore {
    records: Arc<DashMap<i64, Notification>>,
    by_request_id: Arc<DashMap<String, i64>>,
    next_id: Arc<AtomicI64>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            by_request_id: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }

    fn insert_record(&self, req: &NotificationRequest, recipient: &str) -> Notification {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = OffsetDateTime::now_utc();
        let record = Notification {
            id,
            request_id: Uuid::new_v4().to_string(),
            tenant_id: req.tenant_id,
            kind: req.kind,
            status: NotificationStatus::Pending,
            address: recipient.to_string(),
            body: req.body.clone(),
            headline: req.headline.clone(),
            from: req.from.clone(),
            reply_to: req.reply_to.clone(),
            tag: req.tag.clone(),
            schedule_ts: req.schedule_ts,
            batch_id: req.batch_id.clone(),
            retry_count: 0,
            error_message: None,
            meta: Some(build_record_meta(req)),
            create_time: now,
            update_time: now,
        };
        self.by_request_id.insert(record.request_id.clone(), id);
        self.records.insert(id, record.clone());
        record
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn create_one(
        &self,
        req: &NotificationRequest,
        recipient: &str,
    ) -> Result<Notification, StorageError> {
        Ok(self.insert_record(req, recipient))
    }

    async fn create_bulk(
        &self,
        req: &NotificationRequest,
    ) -> Result<Vec<Notification>, StorageError> {
        if req.recipients.is_empty() {
            return Err(StorageError::permanent("no recipients provided"));
        }
        Ok(req
            .recipients
            .iter()
            .map(|recipient| self.insert_record(req, recipient))
            .collect())
    }

    async fn get_by_id(&self, id: i64) -> Result<Notification, StorageError> {
        self.records
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or_else(|| StorageError::not_found(format!("notification id={id}")))
    }

    async fn get_by_request_id(&self, request_id: &str) -> Result<Notification, StorageError> {
        let id = self
            .by_request_id
            .get(request_id)
            .map(|entry| *entry)
            .ok_or_else(|| StorageError::not_found(format!("notification request_id={request_id}")))?;
        self.get_by_id(id).await
    }

    async fn get_by_batch_id(&self, batch_id: &str) -> Result<Vec<Notification>, StorageError> {
        let mut records: Vec<Notification> = self
            .records
            .iter()
            .filter(|entry| entry.batch_id.as_deref() == Some(batch_id))
            .map(|entry| entry.clone())
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn get_pending_scheduled(&self, now_ts: i64) -> Result<Vec<Notification>, StorageError> {
        let mut due: Vec<Notification> = self
            .records
            .iter()
            .filter(|entry| {
                entry.status == NotificationStatus::Pending
                    && entry.schedule_ts.is_some_and(|ts| ts <= now_ts)
            })
            .map(|entry| entry.clone())
            .collect();
        due.sort_by_key(|r| r.id);
        Ok(due)
    }

    async fn update_status(
        &self,
        id: i64,
        status: NotificationStatus,
        error_message: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut entry = self
            .records
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found(format!("notification id={id}")))?;
        entry.status = status;
        entry.error_message = match (status, error_message) {
            (NotificationStatus::Completed, _) => None,
            (_, Some(message)) => Some(message.to_string()),
            (_, None) => entry.error_message.take(),
        };
        entry.update_time = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn claim(&self, id: i64) -> Result<bool, StorageError> {
        let Some(mut entry) = self.records.get_mut(&id) else {
            return Ok(false);
        };
        if entry.status != NotificationStatus::Pending {
            return Ok(false);
        }
        entry.status = NotificationStatus::Active;
        entry.update_time = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn increment_retry(
        &self,
        id: i64,
        error_message: &str,
    ) -> Result<Notification, StorageError> {
        let mut entry = self
            .records
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found(format!("notification id={id}")))?;
        entry.status = NotificationStatus::Pending;
        entry.retry_count += 1;
        entry.error_message = Some(error_message.to_string());
        entry.update_time = OffsetDateTime::now_utc();
        Ok(entry.clone())
    }

    async fn cancel(&self, request_id: &str) -> Result<bool, StorageError> {
        let Some(id) = self.by_request_id.get(request_id).map(|entry| *entry) else {
            return Err(StorageError::not_found(format!(
                "notification request_id={request_id}"
            )));
        };
        let mut entry = self
            .records
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found(format!("notification id={id}")))?;
        if entry.status.is_terminal() {
            return Ok(false);
        }
        entry.status = NotificationStatus::Cancel;
        entry.update_time = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn get_by_tenant_and_status(
        &self,
        tenant_id: i64,
        status: NotificationStatus,
        limit: i64,
    ) -> Result<Vec<Notification>, StorageError> {
        let mut records: Vec<Notification> = self
            .records
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id && entry.status == status)
            .map(|entry| entry.clone())
            .collect();
        records.sort_by_key(|r| r.id);
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }
}

/// DashMap-backed partner config store, keyed by tenant id.
#[derive(Clone, Default)]
pub struct InMemoryConfigStore {
    configs: Arc<DashMap<i64, PartnerConfig>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a config without bumping the version; test convenience.
    pub fn seed(&self, config: PartnerConfig) {
        self.configs.insert(config.tenant_id, config);
    }
}

#[async_trait]
impl PartnerConfigStore for InMemoryConfigStore {
    async fn get_by_tenant(&self, tenant_id: i64) -> Result<PartnerConfig, StorageError> {
        self.configs
            .get(&tenant_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| StorageError::not_found(format!("partner config tenant_id={tenant_id}")))
    }

    async fn save(&self, config: &PartnerConfig) -> Result<PartnerConfig, StorageError> {
        let mut stored = config.clone();
        stored.update_time = OffsetDateTime::now_utc();
        stored.version = self
            .configs
            .get(&config.tenant_id)
            .map(|existing| existing.version + 1)
            .unwrap_or(1);
        self.configs.insert(stored.tenant_id, stored.clone());
        Ok(stored)
    }

    async fn version_of(&self, tenant_id: i64) -> Result<i64, StorageError> {
        self.configs
            .get(&tenant_id)
            .map(|entry| entry.version)
            .ok_or_else(|| StorageError::not_found(format!("partner config tenant_id={tenant_id}")))
    }

    async fn list_enabled(&self) -> Result<Vec<PartnerConfig>, StorageError> {
        let mut configs: Vec<PartnerConfig> = self
            .configs
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.clone())
            .collect();
        configs.sort_by_key(|c| c.tenant_id);
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{MessageType, NotificationKind};

    fn request(recipients: &[&str]) -> NotificationRequest {
        NotificationRequest {
            tenant_id: 1001,
            kind: NotificationKind::Email,
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            body: "hi".into(),
            headline: None,
            from: None,
            reply_to: None,
            tag: None,
            schedule_ts: None,
            message_type: MessageType::System,
            data: None,
            request_id: Some("orig".into()),
            batch_id: Some("batch-1".into()),
            meta: None,
        }
    }

    #[tokio::test]
    async fn bulk_create_one_row_per_recipient_with_unique_ids() {
        let store = InMemoryNotificationStore::new();
        let records = store
            .create_bulk(&request(&["a@x", "b@x", "c@x"]))
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        let mut request_ids: Vec<_> = records.iter().map(|r| r.request_id.clone()).collect();
        request_ids.sort();
        request_ids.dedup();
        assert_eq!(request_ids.len(), 3);
        // creation order matches recipient order
        assert_eq!(records[0].address, "a@x");
        assert_eq!(records[2].address, "c@x");
        assert!(records.iter().all(|r| r.status == NotificationStatus::Pending));
        assert_eq!(records[0].original_request_id(), Some("orig"));
    }

    #[tokio::test]
    async fn create_one_mints_a_fresh_request_id() {
        let store = InMemoryNotificationStore::new();
        let record = store
            .create_one(&request(&["a@x"]), "a@x")
            .await
            .unwrap();
        assert_eq!(record.status, NotificationStatus::Pending);
        assert_ne!(record.request_id, "orig");
        assert_eq!(record.original_request_id(), Some("orig"));
        let fetched = store.get_by_request_id(&record.request_id).await.unwrap();
        assert_eq!(fetched.id, record.id);
    }

    #[tokio::test]
    async fn claim_is_first_write_wins() {
        let store = InMemoryNotificationStore::new();
        let records = store.create_bulk(&request(&["a@x"])).await.unwrap();
        let id = records[0].id;
        assert!(store.claim(id).await.unwrap());
        assert!(!store.claim(id).await.unwrap());
        let record = store.get_by_id(id).await.unwrap();
        assert_eq!(record.status, NotificationStatus::Active);
    }

    #[tokio::test]
    async fn completed_clears_error_message() {
        let store = InMemoryNotificationStore::new();
        let records = store.create_bulk(&request(&["a@x"])).await.unwrap();
        let id = records[0].id;
        store
            .update_status(id, NotificationStatus::Active, Some("warming up"))
            .await
            .unwrap();
        store
            .update_status(id, NotificationStatus::Completed, None)
            .await
            .unwrap();
        let record = store.get_by_id(id).await.unwrap();
        assert_eq!(record.status, NotificationStatus::Completed);
        assert!(record.error_message.is_none());
    }

    #[tokio::test]
    async fn pending_scheduled_filters_by_due_time() {
        let store = InMemoryNotificationStore::new();
        let mut due = request(&["a@x"]);
        due.schedule_ts = Some(100);
        let mut later = request(&["b@x"]);
        later.schedule_ts = Some(500);
        let unscheduled = request(&["c@x"]);
        store.create_bulk(&due).await.unwrap();
        store.create_bulk(&later).await.unwrap();
        store.create_bulk(&unscheduled).await.unwrap();

        let found = store.get_pending_scheduled(100).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "a@x");
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_records() {
        let store = InMemoryNotificationStore::new();
        let records = store.create_bulk(&request(&["a@x"])).await.unwrap();
        let record = &records[0];
        assert!(store.cancel(&record.request_id).await.unwrap());
        // already CANCEL: terminal, second cancel reports false
        assert!(!store.cancel(&record.request_id).await.unwrap());
    }

    #[tokio::test]
    async fn config_save_bumps_version() {
        let store = InMemoryConfigStore::new();
        let config = PartnerConfig::new(1001);
        let stored = store.save(&config).await.unwrap();
        assert_eq!(stored.version, 1);
        let stored = store.save(&stored).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(store.version_of(1001).await.unwrap(), 2);
    }
}
