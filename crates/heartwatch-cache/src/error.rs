//! Cache error types.

use thiserror::Error;

/// Errors that can occur talking to the shared cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache value codec error: {0}")]
    Codec(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
