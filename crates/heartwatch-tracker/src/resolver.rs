//! Poll interval and per-device settings resolution.
//!
//! Every live knob is looked up device → group → system in the durable
//! store, then falls back to `heartwatch.toml`. The result is an immutable
//! [`DeviceSettings`] snapshot that one decision uses end to end, cached
//! per instance for a short TTL since intervals rarely change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use heartwatch_core::config::HeartbeatConfig;
use heartwatch_core::{Clock, duration_ms, keys};
use heartwatch_state::{ConfigScope, StateStore};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::TrackerResult;

/// Settings snapshot for one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceSettings {
    /// Effective interval: `max(default, override) * jitter`.
    pub poll_interval: Duration,
    /// Time from `Timeout` to `Offline`.
    pub timeout_grace: Duration,
    /// How long a cached `Online` entry is trusted; `None` = its TTL.
    pub online_update_cache_timeout: Option<Duration>,
    /// TTL of the write-through cache entry.
    pub cache_ttl: Duration,
}

struct CachedSettings {
    expires_at: u64,
    settings: DeviceSettings,
}

#[derive(Default)]
struct SettingsCache {
    entries: HashMap<String, CachedSettings>,
    /// Earliest time the next sweep of expired snapshots may run.
    next_sweep_at: u64,
}

impl SettingsCache {
    fn get(&self, device_id: &str, now: u64) -> Option<DeviceSettings> {
        self.entries
            .get(device_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.settings)
    }

    /// Store a snapshot, sweeping expired ones at most once per TTL.
    fn insert(&mut self, device_id: &str, settings: DeviceSettings, now: u64, ttl_ms: u64) {
        if now >= self.next_sweep_at {
            let before = self.entries.len();
            self.entries.retain(|_, entry| entry.expires_at > now);
            let swept = before - self.entries.len();
            if swept > 0 {
                trace!(swept, "expired settings snapshots dropped");
            }
            self.next_sweep_at = now.saturating_add(ttl_ms);
        }
        self.entries.insert(
            device_id.to_string(),
            CachedSettings {
                expires_at: now.saturating_add(ttl_ms),
                settings,
            },
        );
    }
}

/// Resolves effective heartbeat settings from layered configuration.
pub struct PollIntervalResolver {
    store: StateStore,
    defaults: HeartbeatConfig,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cached: Mutex<SettingsCache>,
}

impl PollIntervalResolver {
    pub fn new(
        store: StateStore,
        defaults: HeartbeatConfig,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            defaults,
            clock,
            ttl,
            cached: Mutex::new(SettingsCache::default()),
        }
    }

    /// Effective poll interval for a device, in milliseconds.
    pub fn resolve(&self, device_id: &str) -> TrackerResult<u64> {
        Ok(duration_ms(self.resolve_settings(device_id)?.poll_interval))
    }

    /// Resolve (or reuse a recent) settings snapshot for a device.
    pub fn resolve_settings(&self, device_id: &str) -> TrackerResult<DeviceSettings> {
        let now = self.clock.now_ms();
        if let Some(settings) = self.cached.lock().ok().and_then(|c| c.get(device_id, now)) {
            return Ok(settings);
        }

        let settings = self.load(device_id)?;
        if let Ok(mut cached) = self.cached.lock() {
            cached.insert(device_id, settings, now, duration_ms(self.ttl));
        }
        Ok(settings)
    }

    /// Drop the cached snapshot for a device so the next call re-reads config.
    pub fn invalidate(&self, device_id: &str) {
        if let Ok(mut cached) = self.cached.lock() {
            cached.entries.remove(device_id);
        }
    }

    /// Number of snapshots currently held, expired ones included.
    pub fn cached_len(&self) -> usize {
        self.cached.lock().map(|c| c.entries.len()).unwrap_or(0)
    }

    /// Drop every cached snapshot.
    pub fn clear(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            cached.entries.clear();
        }
    }

    fn load(&self, device_id: &str) -> TrackerResult<DeviceSettings> {
        let group_id = self
            .store
            .get_device(device_id)?
            .and_then(|record| record.group_id);
        let layers = Layers {
            store: &self.store,
            device: ConfigScope::Device(device_id.to_string()),
            group: group_id.map(ConfigScope::Group),
        };

        // The system layer replaces the file default; device and group
        // layers are overrides that can only lengthen it.
        let default_ms = layers
            .system(keys::POLL_INTERVAL_MS)?
            .and_then(|v| as_millis(keys::POLL_INTERVAL_MS, &v))
            .unwrap_or(self.defaults.default_poll_interval_ms)
            .min(keys::MAX_POLL_INTERVAL_MS);
        let override_ms = layers
            .overrides(keys::POLL_INTERVAL_MS)?
            .and_then(|v| as_millis(keys::POLL_INTERVAL_MS, &v))
            .unwrap_or(default_ms)
            .min(keys::MAX_POLL_INTERVAL_MS);
        let poll_interval_ms = effective_interval_ms(default_ms, override_ms, self.defaults.jitter_factor);

        let grace_secs = layers
            .any(keys::TIMEOUT_GRACE_SECONDS)?
            .and_then(|v| as_millis(keys::TIMEOUT_GRACE_SECONDS, &v))
            .unwrap_or(self.defaults.timeout_grace_seconds)
            .min(keys::MAX_TIMEOUT_GRACE_SECONDS);

        let online_update_cache_timeout = match layers.any(keys::ONLINE_UPDATE_CACHE_TIMEOUT_MS)? {
            Some(Value::Null) => None,
            Some(v) => as_millis(keys::ONLINE_UPDATE_CACHE_TIMEOUT_MS, &v)
                .or(self.defaults.online_update_cache_timeout_ms),
            None => self.defaults.online_update_cache_timeout_ms,
        };

        let poll_interval = Duration::from_millis(poll_interval_ms);
        let timeout_grace = Duration::from_secs(grace_secs);
        let settings = DeviceSettings {
            poll_interval,
            timeout_grace,
            online_update_cache_timeout: online_update_cache_timeout.map(Duration::from_millis),
            cache_ttl: poll_interval
                .saturating_add(timeout_grace)
                .saturating_add(Duration::from_millis(self.defaults.cache_ttl_slack_ms)),
        };
        debug!(%device_id, ?settings, "device settings resolved");
        Ok(settings)
    }
}

/// `max(default, override) * jitter`, rounded up to whole milliseconds.
pub fn effective_interval_ms(default_ms: u64, override_ms: u64, jitter_factor: f64) -> u64 {
    let base = default_ms.max(override_ms) as f64;
    (base * jitter_factor).ceil() as u64
}

struct Layers<'a> {
    store: &'a StateStore,
    device: ConfigScope,
    group: Option<ConfigScope>,
}

impl Layers<'_> {
    /// Device value, else group value.
    fn overrides(&self, key: &str) -> TrackerResult<Option<Value>> {
        if let Some(value) = self.store.get_config(&self.device, key)? {
            return Ok(Some(value));
        }
        match &self.group {
            Some(group) => Ok(self.store.get_config(group, key)?),
            None => Ok(None),
        }
    }

    fn system(&self, key: &str) -> TrackerResult<Option<Value>> {
        Ok(self.store.get_config(&ConfigScope::System, key)?)
    }

    /// Device, group, then system value.
    fn any(&self, key: &str) -> TrackerResult<Option<Value>> {
        match self.overrides(key)? {
            Some(value) => Ok(Some(value)),
            None => self.system(key),
        }
    }
}

fn as_millis(key: &str, value: &Value) -> Option<u64> {
    let parsed = value.as_u64();
    if parsed.is_none() {
        warn!(%key, %value, "ignoring non-integer config value");
    }
    parsed
}
