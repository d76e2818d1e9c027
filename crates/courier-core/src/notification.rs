use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationKind {
    Email,
    Sms,
    Push,
}

impl NotificationKind {
    /// Lowercase channel name, used for rate-limit keys and provider routes.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
            Self::Push => "PUSH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EMAIL" => Some(Self::Email),
            "SMS" => Some(Self::Sms),
            "PUSH" => Some(Self::Push),
            _ => None,
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a persisted notification.
///
/// Legal transitions: PENDING → ACTIVE → {COMPLETED | FAILED | CANCEL}.
/// A retry resets ACTIVE back to PENDING before the next attempt; terminal
/// states never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancel,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancel)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancel => "CANCEL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "ACTIVE" => Some(Self::Active),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCEL" => Some(Self::Cancel),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` follows the state machine.
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        match (self, next) {
            (Pending, Active) | (Pending, Cancel) => true,
            (Active, Completed) | (Active, Failed) | (Active, Cancel) => true,
            // retry path: back to PENDING for a later re-attempt
            (Active, Pending) => true,
            // the immediate path records the terminal outcome directly
            (Pending, Completed) | (Pending, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intent tag used to pick a per-intent "from" identity inside provider
/// configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Bonus,
    Promo,
    Report,
    #[default]
    System,
    Payment,
    Support,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bonus => "bonus",
            Self::Promo => "promo",
            Self::Report => "report",
            Self::System => "system",
            Self::Payment => "payment",
            Self::Support => "support",
        }
    }

    /// Parses a message type, falling back to `System` for unknown or
    /// missing values.
    pub fn parse_or_default(s: Option<&str>) -> Self {
        match s {
            Some("bonus") => Self::Bonus,
            Some("promo") => Self::Promo,
            Some("report") => Self::Report,
            Some("payment") => Self::Payment,
            Some("support") => Self::Support,
            _ => Self::System,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File attachment carried inside notification meta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    /// Base64-encoded content.
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Semi-structured metadata persisted with each record.
///
/// `params` carries `original_request_id` (the caller's request id before
/// per-recipient ids were minted) and `message_type`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl NotificationMeta {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// A durably persisted, addressed notification. One row per recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    /// Externally visible identifier, unique per record.
    pub request_id: String,
    pub tenant_id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub status: NotificationStatus,
    /// Destination: email address, E.164 phone number, or push token.
    pub address: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Epoch-second wall-clock due time for deferred dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<NotificationMeta>,
    #[serde(with = "time::serde::rfc3339")]
    pub create_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub update_time: OffsetDateTime,
}

impl Notification {
    /// Message type recorded at ingress, defaulting to `system`.
    pub fn message_type(&self) -> MessageType {
        MessageType::parse_or_default(
            self.meta
                .as_ref()
                .and_then(|m| m.param_str("message_type")),
        )
    }

    /// The caller's request id before per-recipient ids were minted.
    pub fn original_request_id(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .and_then(|m| m.param_str("original_request_id"))
    }
}

/// Aggregate status of a batch, derived from the statuses of its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Completed,
    PartiallyFailed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::PartiallyFailed => "PARTIALLY_FAILED",
            Self::Failed => "FAILED",
        }
    }
}

/// Per-status counts over the records of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStatusSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
}

impl BatchStatusSummary {
    /// Counts records into completed / failed / still-pending buckets.
    /// CANCEL is terminal but neither a success nor a delivery failure, so it
    /// counts toward `failed` for batch aggregation purposes.
    pub fn of(records: &[Notification]) -> Self {
        let mut summary = Self {
            total: records.len(),
            ..Self::default()
        };
        for record in records {
            match record.status {
                NotificationStatus::Completed => summary.completed += 1,
                NotificationStatus::Failed | NotificationStatus::Cancel => summary.failed += 1,
                NotificationStatus::Pending | NotificationStatus::Active => summary.pending += 1,
            }
        }
        summary
    }

    /// Batch-level status: all settled without failures → COMPLETED; settled
    /// with a mix → PARTIALLY_FAILED; settled with no successes → FAILED;
    /// anything still in flight → PENDING.
    pub fn status(&self) -> BatchStatus {
        if self.pending > 0 {
            BatchStatus::Pending
        } else if self.failed == 0 {
            BatchStatus::Completed
        } else if self.completed > 0 {
            BatchStatus::PartiallyFailed
        } else {
            BatchStatus::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: NotificationStatus) -> Notification {
        Notification {
            id: 1,
            request_id: "r".into(),
            tenant_id: 1001,
            kind: NotificationKind::Email,
            status,
            address: "a@x".into(),
            body: "hi".into(),
            headline: None,
            from: None,
            reply_to: None,
            tag: None,
            schedule_ts: None,
            batch_id: None,
            retry_count: 0,
            error_message: None,
            meta: None,
            create_time: OffsetDateTime::UNIX_EPOCH,
            update_time: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&NotificationStatus::Pending).unwrap(),
            "\"PENDING\""
        );
        assert_eq!(
            serde_json::from_str::<NotificationStatus>("\"CANCEL\"").unwrap(),
            NotificationStatus::Cancel
        );
    }

    #[test]
    fn terminal_states_do_not_transition() {
        use NotificationStatus::*;
        for terminal in [Completed, Failed, Cancel] {
            for next in [Pending, Active, Completed, Failed, Cancel] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn retry_resets_active_to_pending() {
        assert!(NotificationStatus::Active.can_transition_to(NotificationStatus::Pending));
        assert!(!NotificationStatus::Pending.can_transition_to(NotificationStatus::Pending));
    }

    #[test]
    fn message_type_defaults_to_system() {
        assert_eq!(MessageType::parse_or_default(None), MessageType::System);
        assert_eq!(
            MessageType::parse_or_default(Some("weird")),
            MessageType::System
        );
        assert_eq!(
            MessageType::parse_or_default(Some("bonus")),
            MessageType::Bonus
        );
    }

    #[test]
    fn batch_status_derivation() {
        use NotificationStatus::*;
        let all_done = [record(Completed), record(Completed)];
        assert_eq!(BatchStatusSummary::of(&all_done).status(), BatchStatus::Completed);

        let mixed = [record(Completed), record(Failed)];
        assert_eq!(
            BatchStatusSummary::of(&mixed).status(),
            BatchStatus::PartiallyFailed
        );

        let all_failed = [record(Failed), record(Failed)];
        assert_eq!(BatchStatusSummary::of(&all_failed).status(), BatchStatus::Failed);

        let in_flight = [record(Completed), record(Pending)];
        assert_eq!(BatchStatusSummary::of(&in_flight).status(), BatchStatus::Pending);

        // ACTIVE means a worker owns it right now: still pending at batch level
        let active = [record(Active)];
        assert_eq!(BatchStatusSummary::of(&active).status(), BatchStatus::Pending);
    }
}
