//! heartwatch.toml configuration parser.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Values here are the system-wide fallbacks; per-device, per-group and
//! system overrides live in the durable store and win over these.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::keys;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct HeartwatchConfig {
    pub heartbeat: HeartbeatConfig,
    pub resolver: ResolverConfig,
    pub throttle: ThrottleConfig,
    pub stats: StatsConfig,
    pub io: IoConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// System default poll interval; overrides may only lengthen it.
    pub default_poll_interval_ms: u64,
    /// Multiplier (> 1) applied to the interval to absorb client skew.
    pub jitter_factor: f64,
    /// Time a device spends in `Timeout` before it is marked `Offline`.
    pub timeout_grace_seconds: u64,
    /// How long a cached `Online` state is trusted before a durable
    /// re-confirmation. Absent: until the cache entry expires.
    /// `0`: always re-persist.
    pub online_update_cache_timeout_ms: Option<u64>,
    /// Added to interval + grace when computing the cache entry TTL.
    pub cache_ttl_slack_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            default_poll_interval_ms: 60_000,
            jitter_factor: 1.5,
            timeout_grace_seconds: 300,
            online_update_cache_timeout_ms: None,
            cache_ttl_slack_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    /// TTL of the per-instance resolved settings cache.
    pub cache_ttl_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { cache_ttl_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Minimum spacing between persisted reports of one kind per device.
    pub report_window_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            report_window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatsConfig {
    pub interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IoConfig {
    /// Upper bound for a single cache or queue round trip.
    pub timeout_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8480".to_string(),
            data_dir: PathBuf::from("/var/lib/heartwatch"),
        }
    }
}

impl HeartwatchConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the tracker cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.jitter_factor.is_nan() || self.heartbeat.jitter_factor <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "heartbeat.jitter_factor must be greater than 1.0, got {}",
                self.heartbeat.jitter_factor
            )));
        }
        if self.heartbeat.default_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.default_poll_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.heartbeat.default_poll_interval_ms > keys::MAX_POLL_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "heartbeat.default_poll_interval_ms must be at most {}",
                keys::MAX_POLL_INTERVAL_MS
            )));
        }
        if self.heartbeat.timeout_grace_seconds > keys::MAX_TIMEOUT_GRACE_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "heartbeat.timeout_grace_seconds must be at most {}",
                keys::MAX_TIMEOUT_GRACE_SECONDS
            )));
        }
        if self.stats.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "stats.interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io.timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats.interval_ms)
    }

    pub fn report_window(&self) -> Duration {
        Duration::from_millis(self.throttle.report_window_ms)
    }
}

impl std::str::FromStr for HeartwatchConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: HeartwatchConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
