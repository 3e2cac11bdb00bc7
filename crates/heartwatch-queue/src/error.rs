//! Queue error types.

use thiserror::Error;

/// Errors that can occur talking to the delayed-delivery queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

pub type QueueResult<T> = Result<T, QueueError>;
