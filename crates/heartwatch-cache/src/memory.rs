//! In-process shared cache with TTL expiration and LRU eviction.
//!
//! Clones share one map behind a mutex. Expiry is measured against the
//! injected [`Clock`], so tests drive TTLs without sleeping. Statistics
//! (hits, misses, expirations, evictions) are kept per cache and logged
//! at `trace` level.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use heartwatch_core::{Clock, duration_ms};
use tracing::{debug, trace};

use crate::{CacheError, CacheResult, SharedCache};

/// Configuration for the in-process cache.
#[derive(Clone, Debug)]
pub struct MemoryCacheConfig {
    /// Maximum number of live entries (default: 1_000_000).
    pub max_entries: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000_000,
        }
    }
}

/// Accumulated cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
}

struct CacheEntry {
    value: String,
    /// Epoch ms after which the entry is dead.
    expires_at: u64,
    /// Access sequence number for LRU tracking.
    last_accessed: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    access_seq: u64,
    stats: CacheStats,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.access_seq += 1;
        self.access_seq
    }

    /// Drop `key` if it has expired. Returns true if it was removed.
    fn expire(&mut self, key: &str, now: u64) -> bool {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_expired(now));
        if expired {
            self.entries.remove(key);
            self.stats.expirations += 1;
            trace!(%key, expirations = self.stats.expirations, "cache entry expired");
        }
        expired
    }

    fn insert(&mut self, key: &str, value: String, expires_at: u64, max_entries: usize, now: u64) {
        if !self.entries.contains_key(key) && self.entries.len() >= max_entries {
            self.purge_expired(now);
            if self.entries.len() >= max_entries {
                self.evict_lru();
            }
        }
        let last_accessed = self.next_seq();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at,
                last_accessed,
            },
        );
    }

    fn purge_expired(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - self.entries.len();
        self.stats.expirations += purged as u64;
        purged
    }

    fn evict_lru(&mut self) {
        let lru_key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());

        if let Some(key) = lru_key {
            self.entries.remove(&key);
            self.stats.evictions += 1;
            debug!(
                evicted_key = %key,
                cache_evictions = self.stats.evictions,
                "cache LRU eviction"
            );
        }
    }
}

/// Thread-safe in-process [`SharedCache`].
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
    config: MemoryCacheConfig,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(clock, MemoryCacheConfig::default())
    }

    pub fn with_config(clock: Arc<dyn Clock>, config: MemoryCacheConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                access_seq: 0,
                stats: CacheStats::default(),
            })),
            clock,
            config,
        }
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".to_string()))
    }

    fn expires_at(&self, ttl: Duration) -> u64 {
        self.clock.now_ms().saturating_add(duration_ms(ttl))
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> CacheResult<usize> {
        let now = self.clock.now_ms();
        Ok(self.lock()?.purge_expired(now))
    }

    /// Remaining TTL of a live entry.
    pub fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let now = self.clock.now_ms();
        let inner = self.lock()?;
        Ok(inner
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| Duration::from_millis(entry.expires_at - now)))
    }

    /// Number of stored entries, including ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().map(|inner| inner.stats).unwrap_or_default()
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        inner.expire(key, now);

        let seq = inner.next_seq();
        let value = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = seq;
                Some(entry.value.clone())
            }
            None => None,
        };

        if value.is_some() {
            inner.stats.hits += 1;
            trace!(%key, cache_hits = inner.stats.hits, "cache hit");
        } else {
            inner.stats.misses += 1;
            trace!(%key, cache_misses = inner.stats.misses, "cache miss");
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        let now = self.clock.now_ms();
        let expires_at = self.expires_at(ttl);
        let max_entries = self.config.max_entries;
        self.lock()?.insert(key, value, expires_at, max_entries, now);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> CacheResult<bool> {
        let now = self.clock.now_ms();
        let expires_at = self.expires_at(ttl);
        let max_entries = self.config.max_entries;
        let mut inner = self.lock()?;
        inner.expire(key, now);
        if inner.entries.contains_key(key) {
            return Ok(false);
        }
        inner.insert(key, value, expires_at, max_entries, now);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        if inner.expire(key, now) {
            return Ok(false);
        }
        Ok(inner.entries.remove(key).is_some())
    }
}
