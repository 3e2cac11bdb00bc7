//! heartwatch-queue: shared at-least-once delayed delivery.
//!
//! A message enqueued with a delay becomes visible to exactly one
//! consumer once the delay has elapsed. Delivery is at-least-once and
//! cancellation is best-effort: consumers must treat every delivery as a
//! hint to re-validate, never as an unconditional command.
//!
//! [`MemoryDelayedQueue`] is the in-process implementation; clones share
//! one time-ordered heap, so several consumers (instances) can drain it.

pub mod error;
pub mod memory;

pub use error::{QueueError, QueueResult};
pub use memory::MemoryDelayedQueue;

use std::time::Duration;

use async_trait::async_trait;

/// A message that has become due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub key: String,
    pub payload: String,
    /// Epoch ms at which the message became due.
    pub due_at: u64,
}

/// Shared delayed-delivery primitive.
#[async_trait]
pub trait DelayedQueue: Send + Sync {
    /// Make `payload` visible to a consumer after `delay`.
    ///
    /// Re-enqueueing an existing key replaces the pending message.
    async fn enqueue_after(&self, key: &str, payload: String, delay: Duration) -> QueueResult<()>;

    /// Wait for the next due message. `None` once the queue is closed.
    async fn consume(&self) -> QueueResult<Option<Delivery>>;

    /// Best-effort removal of a pending message. Returns true if removed.
    async fn cancel(&self, key: &str) -> QueueResult<bool>;

    /// Stop delivering; pending and future `consume` calls return `None`.
    async fn close(&self);
}
