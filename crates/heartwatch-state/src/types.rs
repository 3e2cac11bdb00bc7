//! Domain types for the Heartwatch state store.
//!
//! These types represent the persisted state of devices, configuration
//! overrides, and telemetry reports. All types are serializable to/from
//! JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

pub use heartwatch_core::{DeviceId, GroupId, HeartbeatState, ReportKind};

// ── Device ────────────────────────────────────────────────────────

/// Durable record of a device's heartbeat state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRecord {
    pub id: DeviceId,
    /// Owning group, consulted for layered config.
    pub group_id: Option<GroupId>,
    pub heartbeat: HeartbeatState,
    /// Epoch ms of the last write that altered `heartbeat`.
    pub last_changed_at: Option<u64>,
    /// Epoch ms of the last accepted heartbeat write (ordering guard).
    pub last_written_at: Option<u64>,
    /// Epoch ms when the device was provisioned.
    pub provisioned_at: u64,
}

impl DeviceRecord {
    /// A never-seen device: `Unknown`, no timestamps.
    pub fn provisioned(id: &str, group_id: Option<&str>, provisioned_at: u64) -> Self {
        Self {
            id: id.to_string(),
            group_id: group_id.map(str::to_string),
            heartbeat: HeartbeatState::Unknown,
            last_changed_at: None,
            last_written_at: None,
            provisioned_at,
        }
    }
}

/// Result of [`crate::StateStore::apply_heartbeat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The stored state changed.
    Changed {
        old: HeartbeatState,
        new: HeartbeatState,
        changed_at: u64,
    },
    /// The stored state already matched; only the write timestamp moved.
    Unchanged { last_changed_at: Option<u64> },
    /// The write was older than the stored write timestamp and was dropped.
    Rejected { stored_written_at: u64 },
}

// ── Config ────────────────────────────────────────────────────────

/// Level at which a configuration override applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum ConfigScope {
    System,
    Group(GroupId),
    Device(DeviceId),
}

impl ConfigScope {
    /// Key prefix shared by every value in this scope.
    pub fn prefix(&self) -> String {
        match self {
            ConfigScope::System => "system/".to_string(),
            ConfigScope::Group(id) => format!("group/{id}/"),
            ConfigScope::Device(id) => format!("device/{id}/"),
        }
    }

    /// Build the composite key for the config table.
    pub fn table_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix())
    }
}

/// A single stored configuration value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigEntry {
    pub scope: ConfigScope,
    pub key: String,
    /// Arbitrary JSON; `null` is a legal value distinct from absence.
    pub value: serde_json::Value,
    pub updated_at: u64,
}

// ── Telemetry ─────────────────────────────────────────────────────

/// Latest persisted telemetry report of one kind for a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRecord {
    pub device_id: DeviceId,
    pub kind: ReportKind,
    pub value: serde_json::Value,
    pub recorded_at: u64,
}

impl TelemetryRecord {
    /// Build the composite key for the telemetry table.
    pub fn table_key(&self) -> String {
        telemetry_key(&self.device_id, &self.kind)
    }
}

pub(crate) fn telemetry_key(device_id: &str, kind: &str) -> String {
    format!("{device_id}/{kind}")
}
