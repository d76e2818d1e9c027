use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::notification::NotificationKind;

/// One configured provider inside a tenant's channel list.
///
/// Lower `priority` wins; ties are broken by position in the list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    /// Registry type tag, e.g. "smtp", "generic-http", "fcm".
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: i32,
    pub enabled: bool,
    /// Free-form provider configuration, interpreted by the factory.
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Per-tenant batching knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub enabled: bool,
    pub max_batch_size: i32,
    pub flush_interval_seconds: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 50,
            flush_interval_seconds: 30,
        }
    }
}

/// Declarative rate-limit entry. Enforcement happens outside the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub window: String,
    pub strategy: String,
}

/// Per-tenant configuration: provider chains per channel, batching, limits.
///
/// `version` increments on every save; provider managers compare it on each
/// lookup so a config write invalidates cached provider instances without a
/// separate invalidation channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerConfig {
    pub tenant_id: i64,
    #[serde(default)]
    pub email_providers: Vec<ProviderDescriptor>,
    #[serde(default)]
    pub sms_providers: Vec<ProviderDescriptor>,
    #[serde(default)]
    pub push_providers: Vec<ProviderDescriptor>,
    #[serde(default)]
    pub batch_config: BatchConfig,
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimit>,
    pub enabled: bool,
    #[serde(default)]
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub create_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub update_time: OffsetDateTime,
}

impl PartnerConfig {
    /// A fresh config with defaults for a tenant that has not been set up.
    pub fn new(tenant_id: i64) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            tenant_id,
            email_providers: Vec::new(),
            sms_providers: Vec::new(),
            push_providers: Vec::new(),
            batch_config: BatchConfig::default(),
            rate_limits: HashMap::new(),
            enabled: true,
            version: 0,
            create_time: now,
            update_time: now,
        }
    }

    /// The descriptor list for a channel.
    pub fn providers_for(&self, kind: NotificationKind) -> &[ProviderDescriptor] {
        match kind {
            NotificationKind::Email => &self.email_providers,
            NotificationKind::Sms => &self.sms_providers,
            NotificationKind::Push => &self.push_providers,
        }
    }

    pub fn providers_for_mut(&mut self, kind: NotificationKind) -> &mut Vec<ProviderDescriptor> {
        match kind {
            NotificationKind::Email => &mut self.email_providers,
            NotificationKind::Sms => &mut self.sms_providers,
            NotificationKind::Push => &mut self.push_providers,
        }
    }

    /// The "current" descriptor for a channel: the first enabled one in
    /// priority order, with list position breaking ties.
    pub fn current_provider(&self, kind: NotificationKind) -> Option<&ProviderDescriptor> {
        self.providers_for(kind)
            .iter()
            .enumerate()
            .filter(|(_, descriptor)| descriptor.enabled)
            .min_by_key(|(index, descriptor)| (descriptor.priority, *index))
            .map(|(_, descriptor)| descriptor)
    }
}
