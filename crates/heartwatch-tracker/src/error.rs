//! Tracker error types.

use heartwatch_cache::CacheError;
use heartwatch_queue::QueueError;
use heartwatch_state::StateError;
use thiserror::Error;

/// Errors that fail a single heartbeat or transition.
///
/// None of these are fatal to the process; the next heartbeat retries.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("state store error: {0}")]
    State(StateError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<StateError> for TrackerError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(id) => TrackerError::UnknownDevice(id),
            other => TrackerError::State(other),
        }
    }
}

impl TrackerError {
    /// Whether the failure came from unreachable or slow infrastructure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TrackerError::Timeout(_)
                | TrackerError::State(_)
                | TrackerError::Cache(_)
                | TrackerError::Queue(_)
        )
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// Run a shared-infrastructure call with an upper bound on its duration.
pub(crate) async fn bounded<T, E, F>(
    op: &'static str,
    limit: std::time::Duration,
    fut: F,
) -> TrackerResult<T>
where
    F: std::future::Future<Output = Result<T, E>>,
    TrackerError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(TrackerError::from),
        Err(_) => Err(TrackerError::Timeout(op)),
    }
}
