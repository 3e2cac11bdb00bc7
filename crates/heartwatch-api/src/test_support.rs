use std::sync::Arc;

use heartwatch_cache::MemoryCache;
use heartwatch_core::{HeartwatchConfig, SystemClock};
use heartwatch_queue::MemoryDelayedQueue;
use heartwatch_state::StateStore;
use heartwatch_tracker::{HeartbeatTracker, ReportThrottle};

use crate::ApiState;

pub(crate) fn test_state() -> ApiState {
    let config = HeartwatchConfig::default();
    let clock = Arc::new(SystemClock::new());
    let store = StateStore::open_in_memory().unwrap();
    let cache = Arc::new(MemoryCache::new(clock.clone()));
    let queue = Arc::new(MemoryDelayedQueue::new(clock.clone()));
    let tracker = Arc::new(HeartbeatTracker::new(
        store.clone(),
        cache.clone(),
        queue,
        clock.clone(),
        &config,
    ));
    let throttle = Arc::new(ReportThrottle::new(
        cache,
        store.clone(),
        clock.clone(),
        config.report_window(),
        config.io_timeout(),
    ));
    ApiState {
        store,
        tracker,
        throttle,
        clock,
    }
}
