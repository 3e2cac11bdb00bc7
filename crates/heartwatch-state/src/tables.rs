//! redb table definitions for the Heartwatch state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Device records keyed by `{device_id}`.
pub const DEVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");

/// Layered config values keyed by `system/{key}`, `group/{gid}/{key}`, `device/{id}/{key}`.
pub const CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("config");

/// Latest telemetry report keyed by `{device_id}/{kind}`.
pub const TELEMETRY: TableDefinition<&str, &[u8]> = TableDefinition::new("telemetry");
