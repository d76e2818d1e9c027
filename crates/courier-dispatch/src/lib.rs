//! The courier dispatch pipeline.
//!
//! Ingress (HTTP or bus) hands requests to the [`BatchingDispatcher`], which
//! either buffers them per (tenant, channel) or forwards them straight to
//! the [`Coordinator`]. The coordinator persists one record per recipient
//! and drives each record through PENDING → ACTIVE → COMPLETED | FAILED with
//! bounded retry. The [`SchedulerWorker`] reaps due scheduled records; the
//! [`ConsumerWorker`] feeds the pipeline from the message bus.

pub mod buffer;
pub mod consumer;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod scheduler;
pub mod settings;

pub use buffer::{Buffer, BufferReady};
pub use consumer::ConsumerWorker;
pub use coordinator::Coordinator;
pub use dispatcher::BatchingDispatcher;
pub use error::DispatchError;
pub use scheduler::SchedulerWorker;
pub use settings::DispatchSettings;
