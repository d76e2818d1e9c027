use courier_bus::BusError;
use courier_core::ValidationError;
use courier_providers::ProviderError;
use courier_storage::StorageError;

/// Errors surfaced from the dispatch pipeline to its callers.
///
/// The transient/permanent split drives the bus consumer's ack/nack
/// decision: a transient error is worth a redelivery, everything else is
/// acked because a retry cannot succeed.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("tenant {tenant_id} is disabled")]
    TenantDisabled { tenant_id: i64 },

    #[error("no partner config for tenant {tenant_id}")]
    ConfigMissing { tenant_id: i64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

impl DispatchError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_transient(),
            Self::Provider(err) => err.is_transient(),
            Self::Validation(_) | Self::TenantDisabled { .. } | Self::ConfigMissing { .. } => false,
            Self::Bus(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_split_drives_ack_nack() {
        assert!(DispatchError::from(StorageError::transient("conn")).is_transient());
        assert!(DispatchError::from(ProviderError::transient("timeout")).is_transient());
        assert!(!DispatchError::from(ProviderError::permanent("bad address")).is_transient());
        assert!(!DispatchError::from(ValidationError::EmptyBody).is_transient());
        assert!(!DispatchError::TenantDisabled { tenant_id: 7 }.is_transient());
    }
}
