//! Fleet-wide rate limit for telemetry persistence.
//!
//! The first report of a kind in a window claims a shared cache key; later
//! reports find the key and are dropped until it expires. Because the key
//! lives in the shared cache, the limit holds across instances.

use std::sync::Arc;
use std::time::Duration;

use heartwatch_cache::SharedCache;
use heartwatch_core::Clock;
use heartwatch_state::{StateStore, TelemetryRecord};
use serde_json::Value;
use tracing::debug;

use crate::error::{TrackerError, TrackerResult, bounded};

pub struct ReportThrottle {
    cache: Arc<dyn SharedCache>,
    store: StateStore,
    clock: Arc<dyn Clock>,
    window: Duration,
    timeout: Duration,
}

impl ReportThrottle {
    pub fn new(
        cache: Arc<dyn SharedCache>,
        store: StateStore,
        clock: Arc<dyn Clock>,
        window: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            clock,
            window,
            timeout,
        }
    }

    pub fn key(device_id: &str, kind: &str) -> String {
        format!("report:{device_id}:{kind}")
    }

    /// Whether a report of `kind` may be persisted now. Claims the window
    /// when it returns true.
    pub async fn should_persist(&self, device_id: &str, kind: &str) -> TrackerResult<bool> {
        if self.window.is_zero() {
            return Ok(true);
        }
        let key = Self::key(device_id, kind);
        let now = self.clock.now_ms().to_string();
        bounded(
            "cache set_if_absent",
            self.timeout,
            self.cache.set_if_absent(&key, now, self.window),
        )
        .await
    }

    /// Persist a telemetry value unless one was persisted within the window.
    ///
    /// Returns whether the value was written.
    pub async fn record(&self, device_id: &str, kind: &str, value: Value) -> TrackerResult<bool> {
        if self.store.get_device(device_id)?.is_none() {
            return Err(TrackerError::UnknownDevice(device_id.to_string()));
        }
        if !self.should_persist(device_id, kind).await? {
            debug!(%device_id, %kind, "report throttled");
            return Ok(false);
        }
        self.store.put_telemetry(&TelemetryRecord {
            device_id: device_id.to_string(),
            kind: kind.to_string(),
            value,
            recorded_at: self.clock.now_ms(),
        })?;
        debug!(%device_id, %kind, "report persisted");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heartwatch_cache::MemoryCache;
    use heartwatch_core::ManualClock;
    use serde_json::json;

    fn throttle(window_ms: u64) -> (ReportThrottle, StateStore, MemoryCache, ManualClock) {
        let clock = ManualClock::new(10_000);
        let cache = MemoryCache::new(Arc::new(clock.clone()));
        let store = StateStore::open_in_memory().unwrap();
        store.provision_device("dev-1", None, 0).unwrap();
        let throttle = ReportThrottle::new(
            Arc::new(cache.clone()),
            store.clone(),
            Arc::new(clock.clone()),
            Duration::from_millis(window_ms),
            Duration::from_secs(1),
        );
        (throttle, store, cache, clock)
    }

    #[tokio::test]
    async fn reports_inside_window_are_dropped() {
        let (throttle, store, _, clock) = throttle(60_000);
        assert!(throttle.record("dev-1", "battery", json!(90)).await.unwrap());

        clock.advance(30_000);
        assert!(!throttle.record("dev-1", "battery", json!(80)).await.unwrap());
        let stored = store.get_telemetry("dev-1", "battery").unwrap().unwrap();
        assert_eq!(stored.value, json!(90));

        clock.advance(30_000);
        assert!(throttle.record("dev-1", "battery", json!(70)).await.unwrap());
        let stored = store.get_telemetry("dev-1", "battery").unwrap().unwrap();
        assert_eq!(stored.value, json!(70));
        assert_eq!(stored.recorded_at, 70_000);
    }

    #[tokio::test]
    async fn kinds_are_throttled_independently() {
        let (throttle, _, _, _) = throttle(60_000);
        assert!(throttle.should_persist("dev-1", "battery").await.unwrap());
        assert!(throttle.should_persist("dev-1", "disk").await.unwrap());
        assert!(!throttle.should_persist("dev-1", "battery").await.unwrap());
    }

    #[tokio::test]
    async fn window_is_shared_across_instances() {
        let (first, store, cache, clock) = throttle(60_000);
        let second = ReportThrottle::new(
            Arc::new(cache),
            store,
            Arc::new(clock.clone()),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );

        assert!(first.record("dev-1", "battery", json!(1)).await.unwrap());
        assert!(!second.record("dev-1", "battery", json!(2)).await.unwrap());
        clock.advance(60_000);
        assert!(second.record("dev-1", "battery", json!(3)).await.unwrap());
    }

    #[tokio::test]
    async fn zero_window_always_persists() {
        let (throttle, _, cache, _) = throttle(0);
        for i in 0..3 {
            assert!(throttle.record("dev-1", "battery", json!(i)).await.unwrap());
        }
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn unknown_device_is_rejected() {
        let (throttle, _, cache, _) = throttle(60_000);
        let err = throttle.record("ghost", "battery", json!(1)).await.unwrap_err();
        assert!(matches!(err, TrackerError::UnknownDevice(_)));
        assert!(cache.is_empty());
    }
}
