use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use courier_bus::Publisher;
use courier_core::{
    BatchNotificationRequest, BatchStatusSummary, NotificationKind, NotificationRequest,
    PartnerConfig, ProviderDescriptor, RateLimit,
};
use courier_storage::{NotificationStore, PartnerConfigStore, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use time::OffsetDateTime;
use tracing::{error, warn};
use uuid::Uuid;

use crate::server::AppState;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: String,
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

fn storage_error(err: StorageError) -> Response {
    if err.is_not_found() {
        error_response(StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
    } else {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "STORAGE_ERROR",
            err.to_string(),
        )
    }
}

fn parse_channel(channel: &str) -> Option<NotificationKind> {
    match channel {
        "email" => Some(NotificationKind::Email),
        "sms" => Some(NotificationKind::Sms),
        "push" => Some(NotificationKind::Push),
        _ => None,
    }
}

// ---- notification ingress ----

#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    pub request_id: String,
    pub status: String,
    pub message: String,
}

/// POST /notifications/send — validate, mint a request id, and hand the
/// request to the bus for asynchronous processing.
pub async fn send_notification(
    State(state): State<AppState>,
    Json(mut request): Json<NotificationRequest>,
) -> Response {
    if let Err(err) = request.validate() {
        return error_response(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", err.to_string());
    }
    let request_id = request.ensure_request_id().to_string();

    let payload = match serde_json::to_vec(&request) {
        Ok(payload) => payload,
        Err(err) => {
            error!(request_id = %request_id, error = %err, "Failed to encode request");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error",
            );
        }
    };

    if let Err(err) = state
        .publisher
        .publish(&state.topic, &request_id, payload)
        .await
    {
        error!(request_id = %request_id, error = %err, "Failed to publish notification");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "QUEUE_ERROR",
            "Failed to queue notification",
        );
    }

    (
        StatusCode::ACCEPTED,
        Json(NotificationResponse {
            request_id,
            status: "queued".into(),
            message: "Notification queued for processing".into(),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct BatchNotificationResponse {
    pub batch_id: String,
    pub total_recipients: usize,
    pub queued_recipients: usize,
    pub status: String,
}

/// POST /notifications/batch — mint a batch id, fan the recipients out into
/// chunked bus messages sharing it.
pub async fn send_batch_notification(
    State(state): State<AppState>,
    Json(request): Json<BatchNotificationRequest>,
) -> Response {
    if request.tenant_id <= 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "MISSING_TENANT_ID",
            "Tenant ID is required in request body",
        );
    }
    if request.recipients.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "recipients list cannot be empty",
        );
    }
    if request.body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "body is required");
    }

    let batch_id = Uuid::new_v4().to_string();
    let total_recipients = request.recipients.len();
    let mut queued_recipients = 0usize;

    for chunk in request.into_chunked_requests(&batch_id, state.batch_chunk_size) {
        let recipients = chunk.recipients.len();
        let key = chunk.request_id.clone().unwrap_or_default();
        match serde_json::to_vec(&chunk) {
            Ok(payload) => match state.publisher.publish(&state.topic, &key, payload).await {
                Ok(()) => queued_recipients += recipients,
                Err(err) => {
                    warn!(batch_id = %batch_id, error = %err, "Failed to publish batch chunk");
                }
            },
            Err(err) => {
                warn!(batch_id = %batch_id, error = %err, "Failed to encode batch chunk");
            }
        }
    }

    (
        StatusCode::ACCEPTED,
        Json(BatchNotificationResponse {
            batch_id,
            total_recipients,
            queued_recipients,
            status: "processing".into(),
        }),
    )
        .into_response()
}

// ---- status queries ----

#[derive(Debug, Serialize)]
pub struct NotificationStatusResponse {
    pub request_id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub tenant_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_ts: Option<i64>,
}

/// GET /notifications/status/{request_id}
pub async fn get_notification_status(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Response {
    match state.store.get_by_request_id(&request_id).await {
        Ok(record) => Json(NotificationStatusResponse {
            request_id: record.request_id,
            status: record.status.as_str().to_string(),
            kind: record.kind.as_str().to_string(),
            tenant_id: record.tenant_id,
            created_at: record.create_time,
            updated_at: record.update_time,
            error_message: record.error_message,
            schedule_ts: record.schedule_ts,
        })
        .into_response(),
        Err(err) => storage_error(err),
    }
}

#[derive(Debug, Serialize)]
pub struct BatchStatusResponse {
    pub batch_id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub tenant_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub total_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub pending_count: usize,
}

/// GET /notifications/batch/{batch_id}/status — counts over the batch's
/// records; `batch_id` is the authoritative grouping key.
pub async fn get_batch_status(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Response {
    let records = match state.store.get_by_batch_id(&batch_id).await {
        Ok(records) => records,
        Err(err) => return storage_error(err),
    };
    let Some(first) = records.first() else {
        return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Batch not found");
    };

    let summary = BatchStatusSummary::of(&records);
    let updated_at = records
        .iter()
        .map(|r| r.update_time)
        .max()
        .unwrap_or(first.update_time);

    Json(BatchStatusResponse {
        batch_id,
        status: summary.status().as_str().to_string(),
        kind: first.kind.as_str().to_string(),
        tenant_id: first.tenant_id,
        created_at: first.create_time,
        updated_at,
        total_count: summary.total,
        completed_count: summary.completed,
        failed_count: summary.failed,
        pending_count: summary.pending,
    })
    .into_response()
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub request_id: String,
    pub status: String,
}

/// POST /notifications/cancel/{request_id} — terminal CANCEL for a record
/// that has not settled yet.
pub async fn cancel_notification(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Response {
    match state.store.cancel(&request_id).await {
        Ok(true) => Json(CancelResponse {
            request_id,
            status: "CANCEL".into(),
        })
        .into_response(),
        Ok(false) => error_response(
            StatusCode::CONFLICT,
            "ALREADY_TERMINAL",
            "Notification already reached a terminal status",
        ),
        Err(err) => storage_error(err),
    }
}

// ---- partner configuration ----

#[derive(Debug, Deserialize)]
pub struct PartnerConfigRequest {
    #[serde(default)]
    pub email_providers: Vec<ProviderDescriptor>,
    #[serde(default)]
    pub sms_providers: Vec<ProviderDescriptor>,
    #[serde(default)]
    pub push_providers: Vec<ProviderDescriptor>,
    #[serde(default)]
    pub batch_config: Option<courier_core::BatchConfig>,
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimit>,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ConfigSuccessResponse {
    pub message: String,
    pub status: String,
    pub tenant_id: i64,
}

/// GET /config/{tenant_id}
pub async fn get_config(State(state): State<AppState>, Path(tenant_id): Path<i64>) -> Response {
    match state.config_store.get_by_tenant(tenant_id).await {
        Ok(config) => Json(config).into_response(),
        Err(err) => storage_error(err),
    }
}

/// PUT /config/{tenant_id} — full replace; invalidates every channel's
/// cached provider for the tenant.
pub async fn update_config(
    State(state): State<AppState>,
    Path(tenant_id): Path<i64>,
    Json(request): Json<PartnerConfigRequest>,
) -> Response {
    let mut config = match state.config_store.get_by_tenant(tenant_id).await {
        Ok(existing) => existing,
        Err(err) if err.is_not_found() => PartnerConfig::new(tenant_id),
        Err(err) => return storage_error(err),
    };

    config.email_providers = request.email_providers;
    config.sms_providers = request.sms_providers;
    config.push_providers = request.push_providers;
    config.batch_config = request.batch_config.unwrap_or_default();
    config.rate_limits = request.rate_limits;
    config.enabled = request.enabled;

    if let Err(err) = state.config_store.save(&config).await {
        return storage_error(err);
    }
    state.invalidate_providers(tenant_id);

    Json(ConfigSuccessResponse {
        message: "Configuration updated successfully".into(),
        status: "success".into(),
        tenant_id,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct AddProviderRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: i32,
    pub enabled: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// POST /config/{tenant_id}/providers/{channel}
pub async fn add_provider(
    State(state): State<AppState>,
    Path((tenant_id, channel)): Path<(i64, String)>,
    Json(request): Json<AddProviderRequest>,
) -> Response {
    let Some(kind) = parse_channel(&channel) else {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_TYPE", "Invalid provider type");
    };

    let mut config = match state.config_store.get_by_tenant(tenant_id).await {
        Ok(existing) => existing,
        Err(err) if err.is_not_found() => PartnerConfig::new(tenant_id),
        Err(err) => return storage_error(err),
    };

    config.providers_for_mut(kind).push(ProviderDescriptor {
        name: request.name,
        kind: request.kind,
        priority: request.priority,
        enabled: request.enabled,
        config: request.config,
    });

    if let Err(err) = state.config_store.save(&config).await {
        return storage_error(err);
    }
    state.invalidate_provider(tenant_id, kind);

    (
        StatusCode::CREATED,
        Json(ConfigSuccessResponse {
            message: format!("{channel} provider added successfully"),
            status: "success".into(),
            tenant_id,
        }),
    )
        .into_response()
}

/// DELETE /config/{tenant_id}/providers/{channel}/{name}
pub async fn remove_provider(
    State(state): State<AppState>,
    Path((tenant_id, channel, name)): Path<(i64, String, String)>,
) -> Response {
    let Some(kind) = parse_channel(&channel) else {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_TYPE", "Invalid provider type");
    };

    let mut config = match state.config_store.get_by_tenant(tenant_id).await {
        Ok(existing) => existing,
        Err(err) => return storage_error(err),
    };

    let providers = config.providers_for_mut(kind);
    let before = providers.len();
    providers.retain(|descriptor| descriptor.name != name);
    if providers.len() == before {
        return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Provider not found");
    }

    if let Err(err) = state.config_store.save(&config).await {
        return storage_error(err);
    }
    state.invalidate_provider(tenant_id, kind);

    Json(ConfigSuccessResponse {
        message: "Provider removed successfully".into(),
        status: "success".into(),
        tenant_id,
    })
    .into_response()
}

// ---- health ----

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// GET /health — reports degraded when the store is unreachable.
pub async fn health(State(state): State<AppState>) -> Response {
    let (status, details) = match state.config_store.list_enabled().await {
        Ok(_) => ("ok".to_string(), None),
        Err(err) => ("degraded".to_string(), Some(err.to_string())),
    };
    Json(HealthResponse {
        status,
        service: "courier".into(),
        details,
    })
    .into_response()
}

/// GET /live — process liveness only.
pub async fn live() -> Response {
    Json(HealthResponse {
        status: "ok".into(),
        service: "courier".into(),
        details: None,
    })
    .into_response()
}

/// GET /ready — 503 until the store answers.
pub async fn ready(State(state): State<AppState>) -> Response {
    match state.config_store.list_enabled().await {
        Ok(_) => Json(HealthResponse {
            status: "ok".into(),
            service: "courier".into(),
            details: None,
        })
        .into_response(),
        Err(err) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "NOT_READY",
            err.to_string(),
        ),
    }
}
