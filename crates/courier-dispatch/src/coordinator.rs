use std::collections::HashMap;
use std::sync::{Arc, Weak};

use courier_core::{
    MessageType, Notification, NotificationKind, NotificationRequest, NotificationStatus,
    PartnerConfig,
};
use courier_providers::{BatchOutcome, ProviderError, ProviderManager};
use courier_storage::{
    DynNotificationStore, DynPartnerConfigStore, NotificationStore, PartnerConfigStore,
    RetryPolicy, with_retries,
};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::settings::DispatchSettings;

pub(crate) fn now_ts() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// The delivery state-machine driver.
///
/// The coordinator is the only component that writes `status` and
/// `error_message`: providers, buffers, and workers below it never touch
/// persisted state.
pub struct Coordinator {
    store: DynNotificationStore,
    config_store: DynPartnerConfigStore,
    email_manager: Arc<ProviderManager>,
    sms_manager: Arc<ProviderManager>,
    push_manager: Arc<ProviderManager>,
    settings: DispatchSettings,
    storage_retry: RetryPolicy,
    // handle to ourselves for the detached retry tasks
    self_ref: Weak<Coordinator>,
}

impl Coordinator {
    pub fn new(
        store: DynNotificationStore,
        config_store: DynPartnerConfigStore,
        email_manager: Arc<ProviderManager>,
        sms_manager: Arc<ProviderManager>,
        push_manager: Arc<ProviderManager>,
        settings: DispatchSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            store,
            config_store,
            email_manager,
            sms_manager,
            push_manager,
            settings,
            storage_retry: RetryPolicy::default(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn store(&self) -> &DynNotificationStore {
        &self.store
    }

    fn manager_for(&self, kind: NotificationKind) -> &ProviderManager {
        match kind {
            NotificationKind::Email => &self.email_manager,
            NotificationKind::Sms => &self.sms_manager,
            NotificationKind::Push => &self.push_manager,
        }
    }

    /// Loads a tenant's partner config, mapping a miss to `ConfigMissing`.
    pub async fn load_config(&self, tenant_id: i64) -> Result<PartnerConfig, DispatchError> {
        match self.config_store.get_by_tenant(tenant_id).await {
            Ok(config) => Ok(config),
            Err(err) if err.is_not_found() => Err(DispatchError::ConfigMissing { tenant_id }),
            Err(err) => Err(err.into()),
        }
    }

    /// End-to-end processing of an inbound request: validate, persist one
    /// PENDING record per recipient, then deliver now, batch, or leave the
    /// records for the scheduler.
    ///
    /// Provider failures after the records are persisted are handled
    /// internally (retry or FAILED) and do not surface here, so a bus
    /// caller can ack as soon as this returns `Ok`.
    pub async fn process(&self, mut request: NotificationRequest) -> Result<(), DispatchError> {
        request.ensure_request_id();
        request.validate()?;

        let config = self.load_config(request.tenant_id).await?;
        if !config.enabled {
            return Err(DispatchError::TenantDisabled {
                tenant_id: request.tenant_id,
            });
        }

        let records = with_retries(self.storage_retry, "create notifications", || {
            self.store.create_bulk(&request)
        })
        .await?;

        info!(
            request_id = request.request_id.as_deref().unwrap_or(""),
            tenant_id = request.tenant_id,
            kind = %request.kind,
            recipients = records.len(),
            scheduled = request.schedule_ts.is_some(),
            "Processing notification request"
        );

        if request.is_scheduled_after(now_ts()) {
            // the scheduler owns these records from here
            return Ok(());
        }

        if config.batch_config.enabled && records.len() > 1 {
            self.process_batch(
                records,
                request.message_type,
                config.batch_config.max_batch_size,
            )
            .await;
        } else {
            for record in records {
                self.send_one(record, request.message_type).await;
            }
        }
        Ok(())
    }

    /// Delivery of an already-persisted record, used by the scheduler and
    /// the retry path after the record was claimed ACTIVE.
    pub async fn process_stored(&self, record: Notification) -> Result<(), DispatchError> {
        let message_type = record.message_type();
        let config = match self.load_config(record.tenant_id).await {
            Ok(config) => config,
            Err(err) => {
                self.mark_failed(record.id, &err.to_string()).await;
                return Err(err);
            }
        };
        if !config.enabled {
            let err = DispatchError::TenantDisabled {
                tenant_id: record.tenant_id,
            };
            self.mark_failed(record.id, &err.to_string()).await;
            return Err(err);
        }
        self.send_one(record, message_type).await;
        Ok(())
    }

    /// Entry point for the drain loops: a set of buffered requests sharing
    /// one (tenant, channel), delivered through provider batch calls.
    pub async fn process_buffered(&self, requests: Vec<NotificationRequest>) {
        let Some(first) = requests.first() else {
            return;
        };
        let tenant_id = first.tenant_id;
        let message_type = first.message_type;

        let config = match self.load_config(tenant_id).await {
            Ok(config) if config.enabled => config,
            _ => {
                // fall back to the per-request path so the error handling
                // stays in one place
                for request in requests {
                    if let Err(err) = self.process(request).await {
                        warn!(tenant_id, error = %err, "Buffered request failed");
                    }
                }
                return;
            }
        };

        let mut records = Vec::new();
        for mut request in requests {
            request.ensure_request_id();
            if let Err(err) = request.validate() {
                warn!(tenant_id, error = %err, "Dropping invalid buffered request");
                continue;
            }
            match with_retries(self.storage_retry, "create notifications", || {
                self.store.create_bulk(&request)
            })
            .await
            {
                Ok(created) => records.extend(created),
                Err(err) => {
                    warn!(
                        tenant_id,
                        request_id = request.request_id.as_deref().unwrap_or(""),
                        error = %err,
                        "Failed to persist buffered request"
                    );
                }
            }
        }

        if records.is_empty() {
            return;
        }
        debug!(tenant_id, count = records.len(), "Delivering drained batch");
        self.process_batch(records, message_type, config.batch_config.max_batch_size)
            .await;
    }

    /// Resolves the provider and performs one delivery attempt.
    async fn attempt_send(
        &self,
        record: &Notification,
        message_type: MessageType,
    ) -> Result<(), ProviderError> {
        let provider = self.manager_for(record.kind).get(record.tenant_id).await?;
        provider.send(record, message_type).await
    }

    /// One immediate delivery with full outcome handling.
    pub async fn send_one(&self, record: Notification, message_type: MessageType) {
        let outcome = self.attempt_send(&record, message_type).await;
        self.apply_outcome(record, message_type, outcome).await;
    }

    /// Groups records by channel, chunks each group into provider windows,
    /// and applies per-item or uniform outcomes.
    pub async fn process_batch(
        &self,
        records: Vec<Notification>,
        message_type: MessageType,
        max_batch_size: i32,
    ) {
        let window_size = if max_batch_size <= 0 {
            crate::buffer::DEFAULT_MAX_SIZE
        } else {
            max_batch_size as usize
        };

        // records of one call share a kind; grouping is defensive
        let mut groups: HashMap<NotificationKind, Vec<Notification>> = HashMap::new();
        for record in records {
            groups.entry(record.kind).or_default().push(record);
        }

        for (kind, group) in groups {
            let mut iter = group.into_iter();
            loop {
                let window: Vec<Notification> = iter.by_ref().take(window_size).collect();
                if window.is_empty() {
                    break;
                }
                self.send_window(kind, window, message_type).await;
            }
        }
    }

    async fn send_window(
        &self,
        kind: NotificationKind,
        window: Vec<Notification>,
        message_type: MessageType,
    ) {
        let tenant_id = window[0].tenant_id;
        let provider = match self.manager_for(kind).get(tenant_id).await {
            Ok(provider) => provider,
            Err(err) => {
                warn!(tenant_id, channel = kind.channel(), error = %err, "Provider resolution failed for window");
                for record in window {
                    self.apply_outcome(record, message_type, Err(err.clone())).await;
                }
                return;
            }
        };

        match provider.send_batch(&window, message_type).await {
            Ok(BatchOutcome::Uniform) => {
                for record in window {
                    self.mark_completed(record.id).await;
                }
            }
            Ok(BatchOutcome::PerItem(results)) => {
                let mut results = results.into_iter();
                for record in window {
                    let result = results.next().unwrap_or_else(|| {
                        Err(ProviderError::transient("missing batch result for record"))
                    });
                    self.apply_outcome(record, message_type, result).await;
                }
            }
            // a window-level failure applies to every item; transient ones
            // re-enter the pipeline individually
            Err(err) => {
                warn!(
                    tenant_id,
                    channel = kind.channel(),
                    count = window.len(),
                    error = %err,
                    "Batch send failed"
                );
                for record in window {
                    self.apply_outcome(record, message_type, Err(err.clone())).await;
                }
            }
        }
    }

    /// Writes the terminal state for one attempt, or schedules a retry for
    /// a recoverable failure with retries left.
    async fn apply_outcome(
        &self,
        record: Notification,
        message_type: MessageType,
        outcome: Result<(), ProviderError>,
    ) {
        match outcome {
            Ok(()) => self.mark_completed(record.id).await,
            Err(err) if err.is_transient() => {
                if record.retry_count >= self.settings.max_retries {
                    warn!(
                        request_id = %record.request_id,
                        retry_count = record.retry_count,
                        "Retries exhausted"
                    );
                    self.mark_failed(record.id, &err.to_string()).await;
                    return;
                }
                match self.store.increment_retry(record.id, &err.to_string()).await {
                    Ok(updated) => {
                        info!(
                            request_id = %updated.request_id,
                            retry_count = updated.retry_count,
                            error = %err,
                            "Scheduling retry"
                        );
                        self.spawn_retry(updated.id, message_type, updated.retry_count);
                    }
                    Err(store_err) => {
                        error!(
                            request_id = %record.request_id,
                            error = %store_err,
                            "Failed to record retry, marking failed"
                        );
                        self.mark_failed(record.id, &err.to_string()).await;
                    }
                }
            }
            Err(err) => {
                self.mark_failed(record.id, &err.to_string()).await;
            }
        }
    }

    /// Background retry loop for one record. Each round sleeps the backoff,
    /// claims the record (losing the claim means a scheduler replica or
    /// another retry took it), and re-attempts delivery.
    fn spawn_retry(&self, id: i64, message_type: MessageType, first_attempt: i32) {
        let Some(coordinator) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut attempt = first_attempt;
            loop {
                tokio::time::sleep(coordinator.settings.backoff_for(attempt)).await;

                match coordinator.store.claim(id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(id, "Retry skipped, record no longer pending");
                        return;
                    }
                    Err(err) => {
                        error!(id, error = %err, "Retry claim failed");
                        return;
                    }
                }

                let record = match coordinator.store.get_by_id(id).await {
                    Ok(record) => record,
                    Err(err) => {
                        error!(id, error = %err, "Retry fetch failed");
                        return;
                    }
                };

                match coordinator.attempt_send(&record, message_type).await {
                    Ok(()) => {
                        coordinator.mark_completed(record.id).await;
                        return;
                    }
                    Err(err) if err.is_transient()
                        && record.retry_count < coordinator.settings.max_retries =>
                    {
                        match coordinator.store.increment_retry(id, &err.to_string()).await {
                            Ok(updated) => {
                                info!(
                                    request_id = %updated.request_id,
                                    retry_count = updated.retry_count,
                                    "Scheduling retry"
                                );
                                attempt = updated.retry_count;
                            }
                            Err(store_err) => {
                                error!(id, error = %store_err, "Failed to record retry");
                                coordinator.mark_failed(id, &err.to_string()).await;
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        coordinator.mark_failed(record.id, &err.to_string()).await;
                        return;
                    }
                }
            }
        });
    }

    async fn mark_completed(&self, id: i64) {
        let result = with_retries(self.storage_retry, "mark completed", || {
            self.store.update_status(id, NotificationStatus::Completed, None)
        })
        .await;
        if let Err(err) = result {
            error!(id, error = %err, "Failed to mark notification completed");
        }
    }

    async fn mark_failed(&self, id: i64, message: &str) {
        let result = with_retries(self.storage_retry, "mark failed", || {
            self.store
                .update_status(id, NotificationStatus::Failed, Some(message))
        })
        .await;
        if let Err(err) = result {
            error!(id, error = %err, "Failed to mark notification failed");
        }
    }
}
