use std::time::Duration;

use async_trait::async_trait;
use courier_core::{MessageType, Notification};
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::DEFAULT_SEND_TIMEOUT_SECS;
use crate::error::{BatchOutcome, ProviderError};
use crate::registry::Provider;

/// SMTP provider configuration, deserialized from the descriptor's free-form
/// config map. The `MSG*From` fields select a per-intent sender identity.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Port")]
    pub port: String,
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Password")]
    pub password: String,
    /// "1" enables SMTP AUTH.
    #[serde(rename = "SMTPAuth", default)]
    pub smtp_auth: Option<String>,
    /// "ssl" for implicit TLS, "tls" for STARTTLS, anything else for plain.
    #[serde(rename = "SMTPSecure", default)]
    pub smtp_secure: Option<String>,
    #[serde(rename = "From", default)]
    pub from: Option<String>,
    #[serde(rename = "FromName", default)]
    pub from_name: Option<String>,
    #[serde(rename = "MSGBonusFrom", default)]
    pub bonus_from: Option<String>,
    #[serde(rename = "MSGPromoFrom", default)]
    pub promo_from: Option<String>,
    #[serde(rename = "MSGReportFrom", default)]
    pub report_from: Option<String>,
    #[serde(rename = "MSGSystemFrom", default)]
    pub system_from: Option<String>,
    #[serde(rename = "MSGPaymentFrom", default)]
    pub payment_from: Option<String>,
    #[serde(rename = "MSGSupportFrom", default)]
    pub support_from: Option<String>,
    #[serde(rename = "MSGBonusFromName", default)]
    pub bonus_from_name: Option<String>,
    #[serde(rename = "MSGPromoFromName", default)]
    pub promo_from_name: Option<String>,
    #[serde(rename = "MSGReportFromName", default)]
    pub report_from_name: Option<String>,
    #[serde(rename = "MSGSystemFromName", default)]
    pub system_from_name: Option<String>,
    #[serde(rename = "MSGPaymentFromName", default)]
    pub payment_from_name: Option<String>,
    #[serde(rename = "MSGSupportFromName", default)]
    pub support_from_name: Option<String>,
    #[serde(rename = "TimeoutSeconds", default)]
    pub timeout_seconds: Option<u64>,
}

impl SmtpConfig {
    /// Sender address for a message type: the per-type address when
    /// configured, the default `From` otherwise.
    pub fn from_address(&self, message_type: MessageType) -> Option<&str> {
        let per_type = match message_type {
            MessageType::Bonus => &self.bonus_from,
            MessageType::Promo => &self.promo_from,
            MessageType::Report => &self.report_from,
            MessageType::System => &self.system_from,
            MessageType::Payment => &self.payment_from,
            MessageType::Support => &self.support_from,
        };
        per_type.as_deref().or(self.from.as_deref())
    }

    /// Sender display name for a message type.
    pub fn from_name(&self, message_type: MessageType) -> Option<&str> {
        let per_type = match message_type {
            MessageType::Bonus => &self.bonus_from_name,
            MessageType::Promo => &self.promo_from_name,
            MessageType::Report => &self.report_from_name,
            MessageType::System => &self.system_from_name,
            MessageType::Payment => &self.payment_from_name,
            MessageType::Support => &self.support_from_name,
        };
        per_type.as_deref().or(self.from_name.as_deref())
    }

    fn auth_enabled(&self) -> bool {
        self.smtp_auth.as_deref() == Some("1")
    }

    fn validate(&self) -> Result<u16, ProviderError> {
        if self.host.is_empty() {
            return Err(ProviderError::invalid_config("SMTP host is required"));
        }
        if self.username.is_empty() {
            return Err(ProviderError::invalid_config("SMTP username is required"));
        }
        if self.password.is_empty() {
            return Err(ProviderError::invalid_config("SMTP password is required"));
        }
        self.port
            .parse::<u16>()
            .map_err(|_| ProviderError::invalid_config(format!("invalid SMTP port {:?}", self.port)))
    }
}

/// Email provider delivering through a configured SMTP relay.
#[derive(Debug)]
pub struct SmtpProvider {
    config: SmtpConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpProvider {
    pub fn from_config(map: &Map<String, Value>) -> Result<Self, ProviderError> {
        let config: SmtpConfig = serde_json::from_value(Value::Object(map.clone()))
            .map_err(|e| ProviderError::invalid_config(format!("smtp config: {e}")))?;
        Self::new(config)
    }

    pub fn new(config: SmtpConfig) -> Result<Self, ProviderError> {
        let port = config.validate()?;
        let timeout = Duration::from_secs(config.timeout_seconds.unwrap_or(DEFAULT_SEND_TIMEOUT_SECS));

        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.host.as_str())
                .port(port)
                .timeout(Some(timeout));

        match config.smtp_secure.as_deref() {
            Some(secure @ ("ssl" | "tls")) => {
                let tls_params = TlsParameters::new(config.host.clone())
                    .map_err(|e| ProviderError::invalid_config(format!("smtp tls: {e}")))?;
                let tls = if secure == "ssl" {
                    Tls::Wrapper(tls_params)
                } else {
                    Tls::Required(tls_params)
                };
                builder = builder.tls(tls);
            }
            _ => {}
        }

        if config.auth_enabled() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            config,
        })
    }

    fn sender_mailbox(
        &self,
        record: &Notification,
        message_type: MessageType,
    ) -> Result<Mailbox, ProviderError> {
        // A record-level from wins over the configured identities.
        let address = record
            .from
            .as_deref()
            .or_else(|| self.config.from_address(message_type))
            .ok_or_else(|| ProviderError::permanent("no sender address configured"))?;

        let mailbox = match self.config.from_name(message_type) {
            Some(name) if record.from.is_none() => format!("{name} <{address}>").parse(),
            _ => address.parse(),
        };
        mailbox.map_err(|e| ProviderError::permanent(format!("invalid sender {address:?}: {e}")))
    }

    fn build_message(
        &self,
        record: &Notification,
        message_type: MessageType,
    ) -> Result<Message, ProviderError> {
        let to: Mailbox = record
            .address
            .parse()
            .map_err(|e| ProviderError::permanent(format!("invalid recipient {:?}: {e}", record.address)))?;

        let mut builder = Message::builder()
            .from(self.sender_mailbox(record, message_type)?)
            .to(to)
            .subject(record.headline.as_deref().unwrap_or_default());

        if let Some(reply_to) = &record.reply_to {
            let mailbox: Mailbox = reply_to
                .parse()
                .map_err(|e| ProviderError::permanent(format!("invalid reply-to {reply_to:?}: {e}")))?;
            builder = builder.reply_to(mailbox);
        }

        builder
            .header(ContentType::TEXT_HTML)
            .body(record.body.clone())
            .map_err(|e| ProviderError::permanent(format!("build message: {e}")))
    }
}

fn classify_smtp(err: lettre::transport::smtp::Error) -> ProviderError {
    if err.is_permanent() {
        ProviderError::permanent(format!("smtp rejected: {err}"))
    } else {
        ProviderError::transient(format!("smtp: {err}"))
    }
}

#[async_trait]
impl Provider for SmtpProvider {
    async fn send(
        &self,
        record: &Notification,
        message_type: MessageType,
    ) -> Result<(), ProviderError> {
        let message = self.build_message(record, message_type)?;
        self.transport.send(message).await.map_err(classify_smtp)?;
        debug!(
            request_id = %record.request_id,
            to = %record.address,
            "SMTP email sent"
        );
        Ok(())
    }

    async fn send_batch(
        &self,
        records: &[Notification],
        message_type: MessageType,
    ) -> Result<BatchOutcome, ProviderError> {
        // SMTP has no multi-message submission; deliver sequentially and
        // report per-item outcomes.
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let result = self.send(record, message_type).await;
            if let Err(err) = &result {
                warn!(
                    request_id = %record.request_id,
                    error = %err,
                    "SMTP send failed inside batch"
                );
            }
            results.push(result);
        }
        Ok(BatchOutcome::PerItem(results))
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        self.config.validate().map(|_| ())
    }

    fn kind(&self) -> &str {
        "smtp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SmtpConfig {
        serde_json::from_value(serde_json::json!({
            "Host": "smtp.example.com",
            "Port": "587",
            "Username": "apikey",
            "Password": "secret",
            "SMTPAuth": "1",
            "SMTPSecure": "tls",
            "MSGSystemFrom": "system@example.com",
            "MSGSystemFromName": "Example System",
            "MSGPromoFrom": "promo@example.com"
        }))
        .unwrap()
    }

    #[test]
    fn per_type_from_with_default_fallback() {
        let mut cfg = config();
        assert_eq!(
            cfg.from_address(MessageType::System),
            Some("system@example.com")
        );
        assert_eq!(
            cfg.from_address(MessageType::Promo),
            Some("promo@example.com")
        );
        // no per-type entry and no default -> none
        assert_eq!(cfg.from_address(MessageType::Payment), None);
        cfg.from = Some("noreply@example.com".into());
        assert_eq!(
            cfg.from_address(MessageType::Payment),
            Some("noreply@example.com")
        );
    }

    #[test]
    fn missing_required_fields_rejected() {
        let err = SmtpProvider::from_config(&Map::new()).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig { .. }));

        let mut bad = config();
        bad.port = "smtp".into();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn provider_builds_from_valid_config() {
        let provider = SmtpProvider::new(config()).unwrap();
        assert_eq!(provider.kind(), "smtp");
        assert!(provider.validate_config().is_ok());
    }
}
