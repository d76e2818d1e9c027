use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{
    Notification, NotificationMeta, NotificationRequest, NotificationStatus, PartnerConfig,
};
use serde_json::Value;

use crate::error::StorageError;

/// Shareable handle to a notification store backend.
pub type DynNotificationStore = Arc<dyn NotificationStore>;

/// Shareable handle to a partner config store backend.
pub type DynPartnerConfigStore = Arc<dyn PartnerConfigStore>;

/// Typed CRUD over persisted notifications.
///
/// Every operation returns a `StorageError` with a NotFound / Transient /
/// Permanent category; the state machine itself is the caller's
/// responsibility — `update_status` performs no old-status check.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persists one PENDING record for `recipient` with a freshly minted
    /// `request_id`. The caller's original request id is preserved in
    /// `meta.params.original_request_id`.
    async fn create_one(
        &self,
        req: &NotificationRequest,
        recipient: &str,
    ) -> Result<Notification, StorageError>;

    /// Atomic bulk insert, one row per recipient in recipient order, with
    /// `batch_id` propagated. Either all rows are created or none.
    async fn create_bulk(&self, req: &NotificationRequest)
    -> Result<Vec<Notification>, StorageError>;

    async fn get_by_id(&self, id: i64) -> Result<Notification, StorageError>;

    async fn get_by_request_id(&self, request_id: &str) -> Result<Notification, StorageError>;

    async fn get_by_batch_id(&self, batch_id: &str) -> Result<Vec<Notification>, StorageError>;

    /// All records with `status = PENDING AND schedule_ts IS NOT NULL AND
    /// schedule_ts <= now_ts`. Indexed; may return thousands of rows.
    async fn get_pending_scheduled(&self, now_ts: i64) -> Result<Vec<Notification>, StorageError>;

    /// Unconditional status write; sets `error_message` when given and
    /// clears it on COMPLETED.
    async fn update_status(
        &self,
        id: i64,
        status: NotificationStatus,
        error_message: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Conditional PENDING → ACTIVE transition used by the scheduler as a
    /// claim. Returns `false` when the record was not in PENDING any more,
    /// i.e. another replica owns it.
    async fn claim(&self, id: i64) -> Result<bool, StorageError>;

    /// Retry bookkeeping: back to PENDING, `retry_count + 1`, last error
    /// recorded. Returns the updated record.
    async fn increment_retry(
        &self,
        id: i64,
        error_message: &str,
    ) -> Result<Notification, StorageError>;

    /// Terminal CANCEL for a non-terminal record, addressed by request id.
    /// Returns `false` when the record had already reached a terminal state.
    async fn cancel(&self, request_id: &str) -> Result<bool, StorageError>;

    async fn get_by_tenant_and_status(
        &self,
        tenant_id: i64,
        status: NotificationStatus,
        limit: i64,
    ) -> Result<Vec<Notification>, StorageError>;
}

/// Typed access to per-tenant partner configuration.
#[async_trait]
pub trait PartnerConfigStore: Send + Sync {
    async fn get_by_tenant(&self, tenant_id: i64) -> Result<PartnerConfig, StorageError>;

    /// Upsert keyed by `tenant_id`. Bumps `version` so provider-manager
    /// caches invalidate on the next lookup. Returns the stored config.
    async fn save(&self, config: &PartnerConfig) -> Result<PartnerConfig, StorageError>;

    /// Current `version` for a tenant; cheap probe for cache validation.
    async fn version_of(&self, tenant_id: i64) -> Result<i64, StorageError>;

    async fn list_enabled(&self) -> Result<Vec<PartnerConfig>, StorageError>;
}

/// Builds the meta blob persisted with each record of a request: the
/// caller-supplied meta, plus `original_request_id` and `message_type`
/// injected into `params`.
pub fn build_record_meta(req: &NotificationRequest) -> NotificationMeta {
    let mut meta = req.meta.clone().unwrap_or_default();
    if let Some(request_id) = &req.request_id {
        meta.params.insert(
            "original_request_id".to_string(),
            Value::String(request_id.clone()),
        );
    }
    meta.params.insert(
        "message_type".to_string(),
        Value::String(req.message_type.as_str().to_string()),
    );
    meta
}
