//! Built-in delivery adapters: email/smtp, sms/generic-http, push/fcm.

mod fcm;
mod http_sms;
mod smtp;

pub use fcm::{FcmConfig, FcmProvider};
pub use http_sms::{GenericHttpSmsConfig, GenericHttpSmsProvider, SmsEndpoint};
pub use smtp::{SmtpConfig, SmtpProvider};

/// Per-send network deadline applied when a provider config does not set one.
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 30;
