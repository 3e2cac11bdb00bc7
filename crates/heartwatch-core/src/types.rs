//! Shared types used across Heartwatch crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a device, owned by the external device registry.
pub type DeviceId = String;

/// Identifier of the group that owns a device.
pub type GroupId = String;

/// Kind of a telemetry report (e.g. "battery", "disk").
pub type ReportKind = String;

/// Coarse reachability of a device, derived from its heartbeats.
///
/// `Unknown` is only ever held by devices that have never sent a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatState {
    #[default]
    Unknown,
    Online,
    Timeout,
    Offline,
}

impl HeartbeatState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatState::Unknown => "unknown",
            HeartbeatState::Online => "online",
            HeartbeatState::Timeout => "timeout",
            HeartbeatState::Offline => "offline",
        }
    }

    /// The state a scheduled downgrade to `self` expects to replace.
    ///
    /// Only `Timeout` and `Offline` are downgrade targets.
    pub fn predecessor(&self) -> Option<HeartbeatState> {
        match self {
            HeartbeatState::Timeout => Some(HeartbeatState::Online),
            HeartbeatState::Offline => Some(HeartbeatState::Timeout),
            HeartbeatState::Unknown | HeartbeatState::Online => None,
        }
    }
}

impl fmt::Display for HeartbeatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognised heartbeat state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStateError(pub String);

impl fmt::Display for ParseStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown heartbeat state: {}", self.0)
    }
}

impl std::error::Error for ParseStateError {}

impl FromStr for HeartbeatState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unknown" => Ok(HeartbeatState::Unknown),
            "online" => Ok(HeartbeatState::Online),
            "timeout" => Ok(HeartbeatState::Timeout),
            "offline" => Ok(HeartbeatState::Offline),
            other => Err(ParseStateError(other.to_string())),
        }
    }
}

/// Names of the layered configuration keys the tracker reads.
pub mod keys {
    pub const POLL_INTERVAL_MS: &str = "poll_interval_ms";
    pub const TIMEOUT_GRACE_SECONDS: &str = "timeout_grace_seconds";
    pub const ONLINE_UPDATE_CACHE_TIMEOUT_MS: &str = "online_update_cache_timeout_ms";

    /// Longest poll interval (before jitter) a device may be given.
    pub const MAX_POLL_INTERVAL_MS: u64 = 7 * 24 * 60 * 60 * 1000;
    /// Longest time a device may sit in `Timeout` before `Offline`.
    pub const MAX_TIMEOUT_GRACE_SECONDS: u64 = 7 * 24 * 60 * 60;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_unknown() {
        assert_eq!(HeartbeatState::default(), HeartbeatState::Unknown);
    }

    #[test]
    fn predecessor_of_downgrade_targets() {
        assert_eq!(
            HeartbeatState::Timeout.predecessor(),
            Some(HeartbeatState::Online)
        );
        assert_eq!(
            HeartbeatState::Offline.predecessor(),
            Some(HeartbeatState::Timeout)
        );
        assert_eq!(HeartbeatState::Online.predecessor(), None);
        assert_eq!(HeartbeatState::Unknown.predecessor(), None);
    }

    #[test]
    fn parse_and_display() {
        for state in [
            HeartbeatState::Unknown,
            HeartbeatState::Online,
            HeartbeatState::Timeout,
            HeartbeatState::Offline,
        ] {
            assert_eq!(state.to_string().parse::<HeartbeatState>(), Ok(state));
        }
        assert_eq!("  ONLINE ".parse(), Ok(HeartbeatState::Online));
        assert!("sleeping".parse::<HeartbeatState>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&HeartbeatState::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        let back: HeartbeatState = serde_json::from_str("\"offline\"").unwrap();
        assert_eq!(back, HeartbeatState::Offline);
    }
}
