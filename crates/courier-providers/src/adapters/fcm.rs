use std::time::Duration;

use async_trait::async_trait;
use courier_core::{MessageType, Notification};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::DEFAULT_SEND_TIMEOUT_SECS;
use crate::error::{BatchOutcome, ProviderError};
use crate::registry::Provider;

const DEFAULT_FCM_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";

/// Firebase Cloud Messaging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FcmConfig {
    pub server_key: String,
    #[serde(default)]
    pub project_id: Option<String>,
    /// Override for tests and proxies; defaults to the FCM send endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub validate_only: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl FcmConfig {
    fn validate(&self) -> Result<(), ProviderError> {
        if self.server_key.is_empty() {
            return Err(ProviderError::invalid_config("FCM server_key is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FcmResponse {
    #[serde(default)]
    failure: i64,
    #[serde(default)]
    results: Vec<FcmResult>,
}

#[derive(Debug, Deserialize)]
struct FcmResult {
    #[serde(default)]
    error: Option<String>,
}

/// Retriable FCM item errors per the downstream error vocabulary.
fn classify_fcm_error(name: &str) -> ProviderError {
    match name {
        "Unavailable" | "InternalServerError" => {
            ProviderError::transient(format!("fcm: {name}"))
        }
        _ => ProviderError::permanent(format!("fcm: {name}")),
    }
}

/// Push provider delivering through FCM. The record address is the device
/// registration token.
#[derive(Debug)]
pub struct FcmProvider {
    config: FcmConfig,
    client: Client,
}

impl FcmProvider {
    pub fn from_config(map: &Map<String, Value>) -> Result<Self, ProviderError> {
        let config: FcmConfig = serde_json::from_value(Value::Object(map.clone()))
            .map_err(|e| ProviderError::invalid_config(format!("fcm config: {e}")))?;
        Self::new(config)
    }

    pub fn new(config: FcmConfig) -> Result<Self, ProviderError> {
        config.validate()?;
        let timeout = Duration::from_secs(config.timeout_seconds.unwrap_or(DEFAULT_SEND_TIMEOUT_SECS));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::invalid_config(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn payload(&self, records: &[Notification]) -> Value {
        // All records of a window share one request body and payload.
        let first = &records[0];
        let mut body = json!({
            "notification": {
                "title": first.headline.clone().unwrap_or_default(),
                "body": first.body,
            },
            "dry_run": self.config.validate_only,
        });
        if let Some(data) = first.meta.as_ref().and_then(|m| m.data.clone()) {
            body["data"] = data;
        }
        if records.len() == 1 {
            body["to"] = Value::String(first.address.clone());
        } else {
            body["registration_ids"] = Value::Array(
                records
                    .iter()
                    .map(|r| Value::String(r.address.clone()))
                    .collect(),
            );
        }
        body
    }

    async fn submit(&self, records: &[Notification]) -> Result<FcmResponse, ProviderError> {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_FCM_ENDPOINT);
        let response = self
            .client
            .post(endpoint)
            .header("Authorization", format!("key={}", self.config.server_key))
            .json(&self.payload(records))
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("fcm request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &body));
        }

        response
            .json::<FcmResponse>()
            .await
            .map_err(|e| ProviderError::transient(format!("fcm response: {e}")))
    }
}

#[async_trait]
impl Provider for FcmProvider {
    async fn send(
        &self,
        record: &Notification,
        _message_type: MessageType,
    ) -> Result<(), ProviderError> {
        let response = self.submit(std::slice::from_ref(record)).await?;
        if response.failure > 0 {
            let error = response
                .results
                .first()
                .and_then(|r| r.error.as_deref())
                .unwrap_or("unknown error");
            return Err(classify_fcm_error(error));
        }
        debug!(request_id = %record.request_id, "FCM push sent");
        Ok(())
    }

    async fn send_batch(
        &self,
        records: &[Notification],
        _message_type: MessageType,
    ) -> Result<BatchOutcome, ProviderError> {
        if records.is_empty() {
            return Ok(BatchOutcome::PerItem(Vec::new()));
        }
        let response = self.submit(records).await?;
        if response.results.len() != records.len() {
            // The multicast API answers one result per token; anything else
            // means we cannot attribute failures.
            if response.failure > 0 {
                warn!(
                    failure = response.failure,
                    expected = records.len(),
                    got = response.results.len(),
                    "FCM returned unattributable failures"
                );
                return Err(ProviderError::transient("fcm: unattributable batch failure"));
            }
            return Ok(BatchOutcome::Uniform);
        }
        Ok(BatchOutcome::PerItem(
            response
                .results
                .into_iter()
                .map(|result| match result.error {
                    None => Ok(()),
                    Some(name) => Err(classify_fcm_error(&name)),
                })
                .collect(),
        ))
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        self.config.validate()
    }

    fn kind(&self) -> &str {
        "fcm"
    }
}
