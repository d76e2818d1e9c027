use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::notification::{MessageType, NotificationKind, NotificationMeta};

/// Maximum accepted base64 attachment payload (10 MiB).
pub const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;

/// Request-shape problems. These are permanent: the same payload will never
/// succeed on retry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("tenant_id is required")]
    MissingTenant,
    #[error("recipients list cannot be empty")]
    EmptyRecipients,
    #[error("recipient address cannot be empty")]
    EmptyRecipient,
    #[error("body is required")]
    EmptyBody,
    #[error("attachment content exceeds {MAX_ATTACHMENT_BYTES} bytes")]
    AttachmentTooLarge,
}

/// Inbound notification request, shared by the HTTP and bus ingress paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub tenant_id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub recipients: Vec<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Epoch seconds; a future value defers dispatch to the scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_ts: Option<i64>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    // Internal fields, minted by the façade or the coordinator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<NotificationMeta>,
}

impl NotificationRequest {
    /// Ensures a request id exists, minting one when the caller did not
    /// supply any. Returns the id.
    pub fn ensure_request_id(&mut self) -> &str {
        if self.request_id.as_deref().is_none_or(str::is_empty) {
            self.request_id = Some(Uuid::new_v4().to_string());
        }
        self.request_id.as_deref().unwrap_or_default()
    }

    /// Structural validation; see `ValidationError` for the rejected shapes.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tenant_id <= 0 {
            return Err(ValidationError::MissingTenant);
        }
        if self.recipients.is_empty() {
            return Err(ValidationError::EmptyRecipients);
        }
        if self.recipients.iter().any(|r| r.trim().is_empty()) {
            return Err(ValidationError::EmptyRecipient);
        }
        if self.body.is_empty() {
            return Err(ValidationError::EmptyBody);
        }
        if let Some(meta) = &self.meta
            && let Some(attachment) = &meta.attachment
            && attachment.content.len() > MAX_ATTACHMENT_BYTES
        {
            return Err(ValidationError::AttachmentTooLarge);
        }
        Ok(())
    }

    /// Whether this request is scheduled strictly after `now_ts`.
    pub fn is_scheduled_after(&self, now_ts: i64) -> bool {
        self.schedule_ts.is_some_and(|ts| ts > now_ts)
    }
}

/// Multi-recipient ingress request; the façade fans it out into chunked
/// `NotificationRequest`s sharing one freshly minted `batch_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNotificationRequest {
    pub tenant_id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub recipients: Vec<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_ts: Option<i64>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl BatchNotificationRequest {
    /// Splits the recipients into chunks of `chunk_size`, producing one
    /// notification request per chunk. All chunks share `batch_id`; each
    /// chunk gets its own request id.
    pub fn into_chunked_requests(self, batch_id: &str, chunk_size: usize) -> Vec<NotificationRequest> {
        let chunk_size = chunk_size.max(1);
        self.recipients
            .chunks(chunk_size)
            .map(|chunk| NotificationRequest {
                tenant_id: self.tenant_id,
                kind: self.kind,
                recipients: chunk.to_vec(),
                body: self.body.clone(),
                headline: self.headline.clone(),
                from: self.from.clone(),
                reply_to: self.reply_to.clone(),
                tag: self.tag.clone(),
                schedule_ts: self.schedule_ts,
                message_type: self.message_type,
                data: self.data.clone(),
                request_id: Some(Uuid::new_v4().to_string()),
                batch_id: Some(batch_id.to_string()),
                meta: None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> NotificationRequest {
        NotificationRequest {
            tenant_id: 1001,
            kind: NotificationKind::Email,
            recipients: vec!["a@x".into()],
            body: "hi".into(),
            headline: None,
            from: None,
            reply_to: None,
            tag: None,
            schedule_ts: None,
            message_type: MessageType::System,
            data: None,
            request_id: None,
            batch_id: None,
            meta: None,
        }
    }

    #[test]
    fn validates_required_fields() {
        assert!(request().validate().is_ok());

        let mut bad = request();
        bad.tenant_id = 0;
        assert_eq!(bad.validate(), Err(ValidationError::MissingTenant));

        let mut bad = request();
        bad.recipients.clear();
        assert_eq!(bad.validate(), Err(ValidationError::EmptyRecipients));

        let mut bad = request();
        bad.body.clear();
        assert_eq!(bad.validate(), Err(ValidationError::EmptyBody));
    }

    #[test]
    fn mints_request_id_only_when_absent() {
        let mut req = request();
        let minted = req.ensure_request_id().to_string();
        assert!(!minted.is_empty());
        assert_eq!(req.ensure_request_id(), minted);

        let mut provided = request();
        provided.request_id = Some("caller-id".into());
        assert_eq!(provided.ensure_request_id(), "caller-id");
    }

    #[test]
    fn scheduled_check_is_strict() {
        let mut req = request();
        assert!(!req.is_scheduled_after(100));
        req.schedule_ts = Some(100);
        assert!(!req.is_scheduled_after(100));
        req.schedule_ts = Some(101);
        assert!(req.is_scheduled_after(100));
    }

    #[test]
    fn batch_fan_out_shares_batch_id() {
        let batch = BatchNotificationRequest {
            tenant_id: 1001,
            kind: NotificationKind::Sms,
            recipients: (0..7).map(|i| format!("+1555000{i:04}")).collect(),
            body: "hello".into(),
            headline: None,
            from: None,
            reply_to: None,
            tag: None,
            schedule_ts: None,
            message_type: MessageType::Promo,
            data: None,
        };
        let requests = batch.into_chunked_requests("batch-1", 3);
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].recipients.len(), 3);
        assert_eq!(requests[2].recipients.len(), 1);
        assert!(requests.iter().all(|r| r.batch_id.as_deref() == Some("batch-1")));
        let ids: std::collections::HashSet<_> =
            requests.iter().map(|r| r.request_id.clone().unwrap()).collect();
        assert_eq!(ids.len(), 3);
    }
}
