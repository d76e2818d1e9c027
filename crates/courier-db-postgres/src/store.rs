use async_trait::async_trait;
use courier_core::{
    BatchConfig, Notification, NotificationKind, NotificationMeta, NotificationRequest,
    NotificationStatus, PartnerConfig,
};
use courier_storage::{NotificationStore, PartnerConfigStore, StorageError, traits::build_record_meta};
use dashmap::DashSet;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

/// Maps sqlx failures onto the storage error categories: infrastructure
/// problems are retriable, constraint and decode problems are not.
fn classify(err: sqlx::Error, what: &str) -> StorageError {
    match err {
        sqlx::Error::RowNotFound => StorageError::not_found(what),
        sqlx::Error::Io(e) => StorageError::transient(format!("{what}: {e}")),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StorageError::transient(format!("{what}: connection pool unavailable"))
        }
        sqlx::Error::Tls(e) => StorageError::transient(format!("{what}: {e}")),
        sqlx::Error::Database(db) => StorageError::permanent(format!("{what}: {db}")),
        other => StorageError::permanent(format!("{what}: {other}")),
    }
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: i64,
    request_id: String,
    tenant_id: i64,
    kind: String,
    status: String,
    address: String,
    body: String,
    headline: Option<String>,
    from_addr: Option<String>,
    reply_to: Option<String>,
    tag: Option<String>,
    schedule_ts: Option<i64>,
    batch_id: Option<String>,
    retry_count: i32,
    error_message: Option<String>,
    meta: Option<serde_json::Value>,
    create_time: OffsetDateTime,
    update_time: OffsetDateTime,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = StorageError;

    fn try_from(row: NotificationRow) -> Result<Self, StorageError> {
        let kind = NotificationKind::parse(&row.kind)
            .ok_or_else(|| StorageError::permanent(format!("unknown kind {:?}", row.kind)))?;
        let status = NotificationStatus::parse(&row.status)
            .ok_or_else(|| StorageError::permanent(format!("unknown status {:?}", row.status)))?;
        let meta = row
            .meta
            .map(serde_json::from_value::<NotificationMeta>)
            .transpose()
            .map_err(|e| StorageError::permanent(format!("malformed meta: {e}")))?;
        Ok(Notification {
            id: row.id,
            request_id: row.request_id,
            tenant_id: row.tenant_id,
            kind,
            status,
            address: row.address,
            body: row.body,
            headline: row.headline,
            from: row.from_addr,
            reply_to: row.reply_to,
            tag: row.tag,
            schedule_ts: row.schedule_ts,
            batch_id: row.batch_id,
            retry_count: row.retry_count,
            error_message: row.error_message,
            meta,
            create_time: row.create_time,
            update_time: row.update_time,
        })
    }
}

const NOTIFICATION_COLUMNS: &str = "id, request_id, tenant_id, kind, status, address, body, \
     headline, from_addr, reply_to, tag, schedule_ts, batch_id, retry_count, error_message, \
     meta, create_time, update_time";

/// PostgreSQL implementation of the notification store.
#[derive(Clone)]
pub struct PostgresNotificationStore {
    pool: PgPool,
    tables_created: Arc<DashSet<String>>,
}

impl PostgresNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables_created: Arc::new(DashSet::new()),
        }
    }

    async fn ensure_tables(&self) -> Result<(), StorageError> {
        if self.tables_created.contains("notifications") {
            return Ok(());
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id BIGSERIAL PRIMARY KEY,
                request_id TEXT NOT NULL,
                tenant_id BIGINT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                address TEXT NOT NULL,
                body TEXT NOT NULL,
                headline TEXT,
                from_addr TEXT,
                reply_to TEXT,
                tag TEXT,
                schedule_ts BIGINT,
                batch_id TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                meta JSONB,
                create_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                update_time TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, "create notifications table"))?;

        sqlx::raw_sql(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_notifications_request_id ON notifications(request_id);
            CREATE INDEX IF NOT EXISTS idx_notifications_scheduled ON notifications(schedule_ts, status) WHERE schedule_ts IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_notifications_tenant_status ON notifications(tenant_id, status);
            CREATE INDEX IF NOT EXISTS idx_notifications_batch ON notifications(batch_id) WHERE batch_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_notifications_kind_status ON notifications(kind, status);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, "create notifications indexes"))?;

        info!("Created notifications table");
        self.tables_created.insert("notifications".to_string());
        Ok(())
    }

    fn meta_json(req: &NotificationRequest) -> Result<serde_json::Value, StorageError> {
        serde_json::to_value(build_record_meta(req))
            .map_err(|e| StorageError::permanent(format!("serialize meta: {e}")))
    }

    async fn insert_one<'e, E>(
        executor: E,
        req: &NotificationRequest,
        recipient: &str,
        meta: &serde_json::Value,
    ) -> Result<Notification, StorageError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let row: NotificationRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO notifications (
                request_id, tenant_id, kind, status, address, body, headline,
                from_addr, reply_to, tag, schedule_ts, batch_id, meta
            ) VALUES ($1, $2, $3, 'PENDING', $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(req.tenant_id)
        .bind(req.kind.as_str())
        .bind(recipient)
        .bind(&req.body)
        .bind(&req.headline)
        .bind(&req.from)
        .bind(&req.reply_to)
        .bind(&req.tag)
        .bind(req.schedule_ts)
        .bind(&req.batch_id)
        .bind(meta)
        .fetch_one(executor)
        .await
        .map_err(|e| classify(e, "insert notification"))?;

        row.try_into()
    }
}

#[async_trait]
impl NotificationStore for PostgresNotificationStore {
    async fn create_one(
        &self,
        req: &NotificationRequest,
        recipient: &str,
    ) -> Result<Notification, StorageError> {
        self.ensure_tables().await?;
        let meta = Self::meta_json(req)?;
        let record = Self::insert_one(&self.pool, req, recipient, &meta).await?;
        debug!(request_id = %record.request_id, tenant_id = record.tenant_id, "Stored notification");
        Ok(record)
    }

    async fn create_bulk(
        &self,
        req: &NotificationRequest,
    ) -> Result<Vec<Notification>, StorageError> {
        if req.recipients.is_empty() {
            return Err(StorageError::permanent("no recipients provided"));
        }
        self.ensure_tables().await?;
        let meta = Self::meta_json(req)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify(e, "begin bulk insert"))?;

        let mut records = Vec::with_capacity(req.recipients.len());
        for recipient in &req.recipients {
            records.push(Self::insert_one(&mut *tx, req, recipient, &meta).await?);
        }

        tx.commit()
            .await
            .map_err(|e| classify(e, "commit bulk insert"))?;

        debug!(
            tenant_id = req.tenant_id,
            count = records.len(),
            batch_id = req.batch_id.as_deref().unwrap_or(""),
            "Bulk created notifications"
        );
        Ok(records)
    }

    async fn get_by_id(&self, id: i64) -> Result<Notification, StorageError> {
        self.ensure_tables().await?;
        let row: NotificationRow = sqlx::query_as(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify(e, &format!("notification id={id}")))?;
        row.try_into()
    }

    async fn get_by_request_id(&self, request_id: &str) -> Result<Notification, StorageError> {
        self.ensure_tables().await?;
        let row: NotificationRow = sqlx::query_as(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE request_id = $1"
        ))
        .bind(request_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify(e, &format!("notification request_id={request_id}")))?;
        row.try_into()
    }

    async fn get_by_batch_id(&self, batch_id: &str) -> Result<Vec<Notification>, StorageError> {
        self.ensure_tables().await?;
        let rows: Vec<NotificationRow> = sqlx::query_as(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE batch_id = $1 ORDER BY id"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, &format!("notifications batch_id={batch_id}")))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn get_pending_scheduled(&self, now_ts: i64) -> Result<Vec<Notification>, StorageError> {
        self.ensure_tables().await?;
        let rows: Vec<NotificationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS} FROM notifications
            WHERE status = 'PENDING' AND schedule_ts IS NOT NULL AND schedule_ts <= $1
            ORDER BY schedule_ts, id
            "#
        ))
        .bind(now_ts)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, "pending scheduled notifications"))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_status(
        &self,
        id: i64,
        status: NotificationStatus,
        error_message: Option<&str>,
    ) -> Result<(), StorageError> {
        self.ensure_tables().await?;
        sqlx::query(
            r#"
            UPDATE notifications
            SET status = $2,
                error_message = CASE
                    WHEN $2 = 'COMPLETED' THEN NULL
                    ELSE COALESCE($3, error_message)
                END,
                update_time = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, &format!("update status id={id}")))?;
        Ok(())
    }

    async fn claim(&self, id: i64) -> Result<bool, StorageError> {
        self.ensure_tables().await?;
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'ACTIVE', update_time = NOW()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, &format!("claim id={id}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_retry(
        &self,
        id: i64,
        error_message: &str,
    ) -> Result<Notification, StorageError> {
        self.ensure_tables().await?;
        let row: NotificationRow = sqlx::query_as(&format!(
            r#"
            UPDATE notifications
            SET status = 'PENDING',
                retry_count = retry_count + 1,
                error_message = $2,
                update_time = NOW()
            WHERE id = $1
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(error_message)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify(e, &format!("increment retry id={id}")))?;
        row.try_into()
    }

    async fn cancel(&self, request_id: &str) -> Result<bool, StorageError> {
        self.ensure_tables().await?;
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'CANCEL', update_time = NOW()
            WHERE request_id = $1 AND status IN ('PENDING', 'ACTIVE')
            "#,
        )
        .bind(request_id)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, &format!("cancel request_id={request_id}")))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Distinguish "already terminal" from "no such record".
        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM notifications WHERE request_id = $1")
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| classify(e, &format!("cancel lookup request_id={request_id}")))?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StorageError::not_found(format!(
                "notification request_id={request_id}"
            ))),
        }
    }

    async fn get_by_tenant_and_status(
        &self,
        tenant_id: i64,
        status: NotificationStatus,
        limit: i64,
    ) -> Result<Vec<Notification>, StorageError> {
        self.ensure_tables().await?;
        let rows: Vec<NotificationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS} FROM notifications
            WHERE tenant_id = $1 AND status = $2
            ORDER BY id
            LIMIT $3
            "#
        ))
        .bind(tenant_id)
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, "notifications by tenant and status"))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct PartnerConfigRow {
    tenant_id: i64,
    email_providers: serde_json::Value,
    sms_providers: serde_json::Value,
    push_providers: serde_json::Value,
    batch_config: serde_json::Value,
    rate_limits: serde_json::Value,
    enabled: bool,
    version: i64,
    create_time: OffsetDateTime,
    update_time: OffsetDateTime,
}

impl TryFrom<PartnerConfigRow> for PartnerConfig {
    type Error = StorageError;

    fn try_from(row: PartnerConfigRow) -> Result<Self, StorageError> {
        let decode = |what: &str, value: serde_json::Value| {
            serde_json::from_value(value)
                .map_err(|e| StorageError::permanent(format!("malformed {what}: {e}")))
        };
        Ok(PartnerConfig {
            tenant_id: row.tenant_id,
            email_providers: decode("email_providers", row.email_providers)?,
            sms_providers: decode("sms_providers", row.sms_providers)?,
            push_providers: decode("push_providers", row.push_providers)?,
            batch_config: serde_json::from_value::<BatchConfig>(row.batch_config)
                .map_err(|e| StorageError::permanent(format!("malformed batch_config: {e}")))?,
            rate_limits: serde_json::from_value::<HashMap<_, _>>(row.rate_limits)
                .map_err(|e| StorageError::permanent(format!("malformed rate_limits: {e}")))?,
            enabled: row.enabled,
            version: row.version,
            create_time: row.create_time,
            update_time: row.update_time,
        })
    }
}

const PARTNER_CONFIG_COLUMNS: &str = "tenant_id, email_providers, sms_providers, push_providers, \
     batch_config, rate_limits, enabled, version, create_time, update_time";

/// PostgreSQL implementation of the partner config store.
#[derive(Clone)]
pub struct PostgresConfigStore {
    pool: PgPool,
    tables_created: Arc<DashSet<String>>,
}

impl PostgresConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables_created: Arc::new(DashSet::new()),
        }
    }

    async fn ensure_tables(&self) -> Result<(), StorageError> {
        if self.tables_created.contains("partner_configs") {
            return Ok(());
        }

        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS partner_configs (
                tenant_id BIGINT PRIMARY KEY,
                email_providers JSONB NOT NULL DEFAULT '[]',
                sms_providers JSONB NOT NULL DEFAULT '[]',
                push_providers JSONB NOT NULL DEFAULT '[]',
                batch_config JSONB NOT NULL DEFAULT '{}',
                rate_limits JSONB NOT NULL DEFAULT '{}',
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                version BIGINT NOT NULL DEFAULT 0,
                create_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                update_time TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_partner_configs_enabled ON partner_configs(enabled);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, "create partner_configs table"))?;

        info!("Created partner_configs table");
        self.tables_created.insert("partner_configs".to_string());
        Ok(())
    }
}

#[async_trait]
impl PartnerConfigStore for PostgresConfigStore {
    async fn get_by_tenant(&self, tenant_id: i64) -> Result<PartnerConfig, StorageError> {
        self.ensure_tables().await?;
        let row: PartnerConfigRow = sqlx::query_as(&format!(
            "SELECT {PARTNER_CONFIG_COLUMNS} FROM partner_configs WHERE tenant_id = $1"
        ))
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify(e, &format!("partner config tenant_id={tenant_id}")))?;
        row.try_into()
    }

    async fn save(&self, config: &PartnerConfig) -> Result<PartnerConfig, StorageError> {
        self.ensure_tables().await?;
        let encode = |what: &str, value: Result<serde_json::Value, serde_json::Error>| {
            value.map_err(|e| StorageError::permanent(format!("serialize {what}: {e}")))
        };
        let email = encode("email_providers", serde_json::to_value(&config.email_providers))?;
        let sms = encode("sms_providers", serde_json::to_value(&config.sms_providers))?;
        let push = encode("push_providers", serde_json::to_value(&config.push_providers))?;
        let batch = encode("batch_config", serde_json::to_value(config.batch_config))?;
        let limits = encode("rate_limits", serde_json::to_value(&config.rate_limits))?;

        let row: PartnerConfigRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO partner_configs (
                tenant_id, email_providers, sms_providers, push_providers,
                batch_config, rate_limits, enabled, version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 1)
            ON CONFLICT (tenant_id) DO UPDATE SET
                email_providers = EXCLUDED.email_providers,
                sms_providers = EXCLUDED.sms_providers,
                push_providers = EXCLUDED.push_providers,
                batch_config = EXCLUDED.batch_config,
                rate_limits = EXCLUDED.rate_limits,
                enabled = EXCLUDED.enabled,
                version = partner_configs.version + 1,
                update_time = NOW()
            RETURNING {PARTNER_CONFIG_COLUMNS}
            "#
        ))
        .bind(config.tenant_id)
        .bind(email)
        .bind(sms)
        .bind(push)
        .bind(batch)
        .bind(limits)
        .bind(config.enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify(e, &format!("save partner config tenant_id={}", config.tenant_id)))?;
        row.try_into()
    }

    async fn version_of(&self, tenant_id: i64) -> Result<i64, StorageError> {
        self.ensure_tables().await?;
        let row: (i64,) =
            sqlx::query_as("SELECT version FROM partner_configs WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| classify(e, &format!("partner config tenant_id={tenant_id}")))?;
        Ok(row.0)
    }

    async fn list_enabled(&self) -> Result<Vec<PartnerConfig>, StorageError> {
        self.ensure_tables().await?;
        let rows: Vec<PartnerConfigRow> = sqlx::query_as(&format!(
            "SELECT {PARTNER_CONFIG_COLUMNS} FROM partner_configs WHERE enabled ORDER BY tenant_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, "enabled partner configs"))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_transient() {
        let err = classify(sqlx::Error::PoolTimedOut, "op");
        assert!(err.is_transient());
        let err = classify(sqlx::Error::PoolClosed, "op");
        assert!(err.is_transient());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = classify(sqlx::Error::RowNotFound, "notification id=5");
        assert!(err.is_not_found());
    }
}
