use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{MessageType, Notification};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::DEFAULT_SEND_TIMEOUT_SECS;
use crate::error::{BatchOutcome, ProviderError};
use crate::registry::Provider;

/// Credentials and originator for one REST endpoint of the SMS gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct SmsEndpoint {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Default sender id for messages routed through this endpoint.
    pub originator: String,
}

/// Vendor-neutral REST SMS gateway configuration.
///
/// Marketing traffic (bonus, promo) and transactional traffic use separate
/// endpoints with their own credentials; `originators` overrides the sender
/// id per message type.
#[derive(Debug, Clone, Deserialize)]
pub struct GenericHttpSmsConfig {
    pub marketing: SmsEndpoint,
    pub transactional: SmsEndpoint,
    #[serde(default)]
    pub originators: HashMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl GenericHttpSmsConfig {
    fn validate(&self) -> Result<(), ProviderError> {
        for (label, endpoint) in [("marketing", &self.marketing), ("transactional", &self.transactional)] {
            if endpoint.url.is_empty() {
                return Err(ProviderError::invalid_config(format!("{label} url is required")));
            }
            if endpoint.username.is_empty() || endpoint.password.is_empty() {
                return Err(ProviderError::invalid_config(format!(
                    "{label} credentials are required"
                )));
            }
        }
        Ok(())
    }

    fn endpoint_for(&self, message_type: MessageType) -> &SmsEndpoint {
        match message_type {
            MessageType::Promo | MessageType::Bonus => &self.marketing,
            _ => &self.transactional,
        }
    }

    fn originator_for(&self, message_type: MessageType) -> &str {
        self.originators
            .get(message_type.as_str())
            .map(String::as_str)
            .unwrap_or(self.endpoint_for(message_type).originator.as_str())
    }
}

#[derive(Serialize)]
struct SmsSendRequest {
    messages: Vec<SmsMessage>,
}

#[derive(Serialize)]
struct SmsMessage {
    to: String,
    from: String,
    text: String,
    id: String,
}

/// SMS provider speaking a generic REST dialect: `POST {url}/messages` with
/// basic auth and a JSON message list.
#[derive(Debug)]
pub struct GenericHttpSmsProvider {
    config: GenericHttpSmsConfig,
    client: Client,
}

impl GenericHttpSmsProvider {
    pub fn from_config(map: &Map<String, Value>) -> Result<Self, ProviderError> {
        let config: GenericHttpSmsConfig = serde_json::from_value(Value::Object(map.clone()))
            .map_err(|e| ProviderError::invalid_config(format!("sms config: {e}")))?;
        Self::new(config)
    }

    pub fn new(config: GenericHttpSmsConfig) -> Result<Self, ProviderError> {
        config.validate()?;
        let timeout = Duration::from_secs(config.timeout_seconds.unwrap_or(DEFAULT_SEND_TIMEOUT_SECS));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::invalid_config(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn message_for(&self, record: &Notification, message_type: MessageType) -> SmsMessage {
        SmsMessage {
            to: record.address.trim_start_matches('+').to_string(),
            from: self.config.originator_for(message_type).to_string(),
            text: record.body.clone(),
            id: format!("{}:{}", record.request_id, Uuid::new_v4().simple()),
        }
    }

    async fn submit(
        &self,
        endpoint: &SmsEndpoint,
        messages: Vec<SmsMessage>,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/messages", endpoint.url.trim_end_matches('/'));
        let count = messages.len();
        let response = self
            .client
            .post(&url)
            .basic_auth(&endpoint.username, Some(&endpoint.password))
            .json(&SmsSendRequest { messages })
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("sms request: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %url, count, "SMS batch accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status.as_u16(), &body))
    }
}

#[async_trait]
impl Provider for GenericHttpSmsProvider {
    async fn send(
        &self,
        record: &Notification,
        message_type: MessageType,
    ) -> Result<(), ProviderError> {
        let endpoint = self.config.endpoint_for(message_type);
        let message = self.message_for(record, message_type);
        self.submit(endpoint, vec![message]).await
    }

    async fn send_batch(
        &self,
        records: &[Notification],
        message_type: MessageType,
    ) -> Result<BatchOutcome, ProviderError> {
        // Records buffered together can carry different message types;
        // group them so each goes through the right endpoint and sender id.
        let mut groups: HashMap<MessageType, Vec<usize>> = HashMap::new();
        for (index, record) in records.iter().enumerate() {
            let effective = record
                .meta
                .as_ref()
                .and_then(|m| m.param_str("message_type"))
                .map(|s| MessageType::parse_or_default(Some(s)))
                .unwrap_or(message_type);
            groups.entry(effective).or_default().push(index);
        }

        let mut results: Vec<Option<Result<(), ProviderError>>> = Vec::new();
        results.resize_with(records.len(), || None);

        for (group_type, indexes) in groups {
            let endpoint = self.config.endpoint_for(group_type);
            let messages = indexes
                .iter()
                .map(|&i| self.message_for(&records[i], group_type))
                .collect();
            let outcome = self.submit(endpoint, messages).await;
            if let Err(err) = &outcome {
                warn!(
                    message_type = %group_type,
                    count = indexes.len(),
                    error = %err,
                    "SMS group send failed"
                );
            }
            for &i in &indexes {
                results[i] = Some(outcome.as_ref().map(|_| ()).map_err(Clone::clone));
            }
        }

        Ok(BatchOutcome::PerItem(
            results
                .into_iter()
                .map(|r| r.unwrap_or_else(|| Ok(())))
                .collect(),
        ))
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        self.config.validate()
    }

    fn kind(&self) -> &str {
        "generic-http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GenericHttpSmsConfig {
        serde_json::from_value(serde_json::json!({
            "marketing": {
                "url": "http://sms.example.com/mrk",
                "username": "mrk-user",
                "password": "mrk-pass",
                "originator": "PromoSender"
            },
            "transactional": {
                "url": "http://sms.example.com/trans",
                "username": "trans-user",
                "password": "trans-pass",
                "originator": "Sender"
            },
            "originators": { "payment": "Payments" }
        }))
        .unwrap()
    }

    #[test]
    fn marketing_traffic_uses_marketing_endpoint() {
        let cfg = config();
        assert_eq!(cfg.endpoint_for(MessageType::Promo).username, "mrk-user");
        assert_eq!(cfg.endpoint_for(MessageType::Bonus).username, "mrk-user");
        assert_eq!(cfg.endpoint_for(MessageType::System).username, "trans-user");
        assert_eq!(cfg.endpoint_for(MessageType::Support).username, "trans-user");
    }

    #[test]
    fn originator_overrides_per_message_type() {
        let cfg = config();
        assert_eq!(cfg.originator_for(MessageType::Payment), "Payments");
        assert_eq!(cfg.originator_for(MessageType::Promo), "PromoSender");
        assert_eq!(cfg.originator_for(MessageType::System), "Sender");
    }

    #[test]
    fn incomplete_config_rejected() {
        let err = GenericHttpSmsProvider::from_config(&Map::new()).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig { .. }));
    }
}
