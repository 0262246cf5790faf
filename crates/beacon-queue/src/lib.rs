//! Durable SQLite-backed event queue and the consumers that drain it.
//!
//! Producers insert rows with [`EventQueue::enqueue`]; [`EventConsumer`]
//! workers claim them with a lease, hand them to an [`EventProcessor`] and
//! either delete them or record the failure for a later retry.

pub mod consumer;
mod error;
pub mod notifier;
mod queue;
pub mod retry;
pub mod store;

pub use consumer::{ConsumerConfig, EventConsumer, EventProcessor, FailedEvent};
pub use error::QueueError;
pub use notifier::{QueueNotifier, WakeSignal};
pub use queue::EventQueue;
pub use retry::RetryPolicy;
pub use store::NewEvent;
