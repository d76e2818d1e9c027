use courier_storage::StorageError;

/// Errors surfaced by providers and the provider manager.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// A retriable delivery failure: timeout, connection problem, 5xx-class
    /// rejection, throttling.
    #[error("transient provider error: {message}")]
    Transient { message: String },

    /// A non-retriable delivery rejection: invalid address, policy
    /// violation, 4xx-class response.
    #[error("permanent provider error: {message}")]
    Permanent { message: String },

    /// The provider configuration is unusable; construction fails without a
    /// partially built instance.
    #[error("invalid provider config: {message}")]
    InvalidConfig { message: String },

    /// The tenant has no enabled provider for the channel.
    #[error("no provider: no enabled {channel} provider for tenant {tenant_id}")]
    NoProvider { tenant_id: i64, channel: &'static str },

    /// The tenant has no partner configuration at all.
    #[error("no partner config for tenant {tenant_id}")]
    ConfigMissing { tenant_id: i64 },
}

impl ProviderError {
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Classifies an HTTP status from a delivery API: timeouts, throttling
    /// and server errors retry; other client errors do not.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            408 | 429 | 500..=599 => Self::transient(format!("status {status}: {body}")),
            _ => Self::permanent(format!("status {status}: {body}")),
        }
    }
}

impl From<StorageError> for ProviderError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Transient { message } => Self::Transient { message },
            StorageError::NotFound { what } => Self::Permanent {
                message: format!("not found: {what}"),
            },
            StorageError::Permanent { message } => Self::Permanent { message },
        }
    }
}

/// Result of a provider batch call: either per-item outcomes aligned with
/// the submitted records, or a uniform outcome for the whole window.
#[derive(Debug)]
pub enum BatchOutcome {
    /// The provider reported one result per record, in submission order.
    PerItem(Vec<Result<(), ProviderError>>),
    /// The provider only reports a single outcome for the whole window.
    Uniform,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(ProviderError::from_status(503, "down").is_transient());
        assert!(ProviderError::from_status(429, "slow down").is_transient());
        assert!(!ProviderError::from_status(400, "bad number").is_transient());
        assert!(!ProviderError::from_status(404, "gone").is_transient());
    }
}
