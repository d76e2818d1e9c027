//! Domain types for the courier notification dispatch engine.
//!
//! This crate is dependency-light on purpose: it holds the durable record
//! model, the wire request shapes, and the per-tenant partner configuration
//! that every other crate in the workspace builds on.

pub mod notification;
pub mod partner;
pub mod request;

pub use notification::{
    Attachment, BatchStatus, BatchStatusSummary, MessageType, Notification, NotificationKind,
    NotificationMeta, NotificationStatus,
};
pub use partner::{BatchConfig, PartnerConfig, ProviderDescriptor, RateLimit};
pub use request::{BatchNotificationRequest, NotificationRequest, ValidationError};
