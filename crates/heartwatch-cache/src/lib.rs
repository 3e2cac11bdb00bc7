//! heartwatch-cache: the shared, TTL-bearing key/value cache.
//!
//! Every Heartwatch instance talks to the same cache through the
//! [`SharedCache`] trait. It is the only place instances agree on
//! "someone already persisted this", so implementations must be safe for
//! concurrent use from many instances.
//!
//! [`MemoryCache`] is the in-process implementation: clones share one
//! map, which is enough for a single daemon and for multi-instance tests.

pub mod error;
pub mod memory;

pub use error::{CacheError, CacheResult};
pub use memory::{CacheStats, MemoryCache, MemoryCacheConfig};

use std::time::Duration;

use async_trait::async_trait;

/// Shared low-latency key/value store with per-key TTL.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Store `value` under `key`, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()>;

    /// Store `value` only if no live value exists. Returns true if stored.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> CacheResult<bool>;

    /// Remove `key`. Returns true if a live value was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;
}
