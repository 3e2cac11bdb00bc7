//! Last-known heartbeat state per device, held in the shared cache.
//!
//! A fresh `Online` entry is the fast-path gate that lets any instance skip
//! a durable write someone else already made. The entry also records the
//! generation of the downgrade currently armed for the device.

use std::sync::Arc;
use std::time::Duration;

use heartwatch_cache::SharedCache;
use heartwatch_core::{DeviceId, HeartbeatState};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{TrackerResult, bounded};

/// Cached heartbeat state for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub device_id: DeviceId,
    pub current_state: HeartbeatState,
    /// Epoch ms of the durable write this entry mirrors.
    pub written_at: u64,
    /// Generation of the pending downgrade for this device.
    pub generation: u64,
}

/// Typed view over [`SharedCache`] for heartbeat entries.
#[derive(Clone)]
pub struct WriteThroughCache {
    cache: Arc<dyn SharedCache>,
    timeout: Duration,
}

impl WriteThroughCache {
    pub fn new(cache: Arc<dyn SharedCache>, timeout: Duration) -> Self {
        Self { cache, timeout }
    }

    pub fn key(device_id: &str) -> String {
        format!("heartbeat:{device_id}")
    }

    /// Read the entry for a device.
    ///
    /// An entry that no longer decodes is treated as absent so the next
    /// heartbeat rewrites it.
    pub async fn get(&self, device_id: &str) -> TrackerResult<Option<CacheEntry>> {
        let key = Self::key(device_id);
        let raw = bounded("cache get", self.timeout, self.cache.get(&key)).await?;
        Ok(raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(%device_id, error = %err, "discarding undecodable cache entry");
                None
            }
        }))
    }

    pub async fn set(&self, entry: &CacheEntry, ttl: Duration) -> TrackerResult<()> {
        let key = Self::key(&entry.device_id);
        let raw = serde_json::to_string(entry)?;
        bounded("cache set", self.timeout, self.cache.set(&key, raw, ttl)).await
    }

    pub async fn delete(&self, device_id: &str) -> TrackerResult<bool> {
        let key = Self::key(device_id);
        bounded("cache delete", self.timeout, self.cache.delete(&key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heartwatch_cache::MemoryCache;
    use heartwatch_core::ManualClock;

    fn cache() -> (WriteThroughCache, MemoryCache, ManualClock) {
        let clock = ManualClock::new(1_000);
        let memory = MemoryCache::new(Arc::new(clock.clone()));
        let cache = WriteThroughCache::new(Arc::new(memory.clone()), Duration::from_secs(1));
        (cache, memory, clock)
    }

    fn entry(state: HeartbeatState) -> CacheEntry {
        CacheEntry {
            device_id: "dev-1".into(),
            current_state: state,
            written_at: 1_000,
            generation: 7,
        }
    }

    #[tokio::test]
    async fn set_get_delete() {
        let (cache, _, _) = cache();
        assert_eq!(cache.get("dev-1").await.unwrap(), None);

        cache
            .set(&entry(HeartbeatState::Online), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            cache.get("dev-1").await.unwrap(),
            Some(entry(HeartbeatState::Online))
        );

        assert!(cache.delete("dev-1").await.unwrap());
        assert_eq!(cache.get("dev-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn entry_expires_with_ttl() {
        let (cache, _, clock) = cache();
        cache
            .set(&entry(HeartbeatState::Timeout), Duration::from_millis(500))
            .await
            .unwrap();
        clock.advance(499);
        assert!(cache.get("dev-1").await.unwrap().is_some());
        clock.advance(1);
        assert!(cache.get("dev-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_entry_reads_as_absent() {
        let (cache, memory, _) = cache();
        memory
            .set("heartbeat:dev-1", "not json".into(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(cache.get("dev-1").await.unwrap(), None);
    }
}
