//! Message-bus contract for courier.
//!
//! The engine only assumes topic publish/subscribe with at-least-once
//! delivery, per-message acknowledgement, and consumer groups that share
//! load across replicas. `InMemoryBus` implements those semantics inside
//! one process for tests and single-node runs; a broker-backed
//! implementation plugs in behind the same traits.

mod memory;
mod traits;

pub use memory::{InMemoryBus, MemoryConsumer};
pub use traits::{BusConsumer, BusError, Delivery, DynPublisher, DynSubscriber, Publisher, Subscriber};
