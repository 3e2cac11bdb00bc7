//! StateStore: redb-backed durable state for Heartwatch.
//!
//! Provides typed operations over device records, layered configuration
//! values, and telemetry reports. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEVICES).map_err(map_err!(Table))?;
        txn.open_table(CONFIG).map_err(map_err!(Table))?;
        txn.open_table(TELEMETRY).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Register a never-seen device in the `Unknown` state.
    pub fn provision_device(
        &self,
        device_id: &str,
        group_id: Option<&str>,
        provisioned_at: u64,
    ) -> StateResult<DeviceRecord> {
        let record = DeviceRecord::provisioned(device_id, group_id, provisioned_at);
        let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            if table.get(device_id).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(device_id.to_string()));
            }
            table
                .insert(device_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%device_id, "device provisioned");
        Ok(record)
    }

    /// Insert or replace a device record as-is.
    ///
    /// Bypasses the heartbeat ordering guard; meant for operators and tests.
    pub fn put_device(&self, record: &DeviceRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a device record by ID.
    pub fn get_device(&self, device_id: &str) -> StateResult<Option<DeviceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        match table.get(device_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: DeviceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Current durable heartbeat state of a device.
    pub fn read_device_state(&self, device_id: &str) -> StateResult<HeartbeatState> {
        self.get_device(device_id)?
            .map(|record| record.heartbeat)
            .ok_or_else(|| StateError::NotFound(device_id.to_string()))
    }

    /// List all devices.
    pub fn list_devices(&self) -> StateResult<Vec<DeviceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: DeviceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete a device and its telemetry. Returns true if it existed.
    pub fn delete_device(&self, device_id: &str) -> StateResult<bool> {
        let prefix = telemetry_key(device_id, "");
        let telemetry_keys = self.keys_with_prefix(TELEMETRY, &prefix)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            existed = table.remove(device_id).map_err(map_err!(Write))?.is_some();
            let mut telemetry = txn.open_table(TELEMETRY).map_err(map_err!(Table))?;
            for key in &telemetry_keys {
                telemetry.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%device_id, existed, "device deleted");
        Ok(existed)
    }

    /// Write a heartbeat state, guarded by the row's last write timestamp.
    ///
    /// Runs as a single read-modify-write transaction. A write whose
    /// `observed_at` is older than the stored `last_written_at` is
    /// rejected. Writing the state already stored refreshes
    /// `last_written_at` but leaves `last_changed_at` alone.
    pub fn apply_heartbeat(
        &self,
        device_id: &str,
        state: HeartbeatState,
        observed_at: u64,
    ) -> StateResult<ApplyOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            let mut record: DeviceRecord = match table.get(device_id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(device_id.to_string())),
            };

            if let Some(stored_written_at) = record.last_written_at {
                if observed_at < stored_written_at {
                    debug!(%device_id, %state, observed_at, stored_written_at, "out-of-order write rejected");
                    return Ok(ApplyOutcome::Rejected { stored_written_at });
                }
            }

            let old = record.heartbeat;
            record.last_written_at = Some(observed_at);
            if old == state {
                outcome = ApplyOutcome::Unchanged {
                    last_changed_at: record.last_changed_at,
                };
            } else {
                record.heartbeat = state;
                record.last_changed_at = Some(observed_at);
                outcome = ApplyOutcome::Changed {
                    old,
                    new: state,
                    changed_at: observed_at,
                };
            }

            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(device_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }

    // ── Config ─────────────────────────────────────────────────────

    /// Insert or update a config value at the given scope.
    pub fn put_config(
        &self,
        scope: &ConfigScope,
        key: &str,
        value: serde_json::Value,
        updated_at: u64,
    ) -> StateResult<()> {
        let table_key = scope.table_key(key);
        let entry = ConfigEntry {
            scope: scope.clone(),
            key: key.to_string(),
            value,
            updated_at,
        };
        let bytes = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONFIG).map_err(map_err!(Table))?;
            table
                .insert(table_key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(key = %table_key, "config value stored");
        Ok(())
    }

    /// Get a config value. `Some(Value::Null)` means explicitly null.
    pub fn get_config(
        &self,
        scope: &ConfigScope,
        key: &str,
    ) -> StateResult<Option<serde_json::Value>> {
        let table_key = scope.table_key(key);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONFIG).map_err(map_err!(Table))?;
        match table.get(table_key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let entry: ConfigEntry =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(entry.value))
            }
            None => Ok(None),
        }
    }

    /// Delete a config value. Returns true if it existed.
    pub fn delete_config(&self, scope: &ConfigScope, key: &str) -> StateResult<bool> {
        let table_key = scope.table_key(key);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(CONFIG).map_err(map_err!(Table))?;
            existed = table
                .remove(table_key.as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// List all config values stored at a scope.
    pub fn list_config(&self, scope: &ConfigScope) -> StateResult<Vec<ConfigEntry>> {
        let prefix = scope.prefix();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONFIG).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let entry: ConfigEntry =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if entry.scope == *scope {
                    results.push(entry);
                }
            }
        }
        Ok(results)
    }

    // ── Telemetry ──────────────────────────────────────────────────

    /// Insert or replace the latest report of a kind for a device.
    pub fn put_telemetry(&self, record: &TelemetryRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TELEMETRY).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the latest report of a kind for a device.
    pub fn get_telemetry(
        &self,
        device_id: &str,
        kind: &str,
    ) -> StateResult<Option<TelemetryRecord>> {
        let key = telemetry_key(device_id, kind);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TELEMETRY).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: TelemetryRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List every report kind stored for a device.
    pub fn list_telemetry(&self, device_id: &str) -> StateResult<Vec<TelemetryRecord>> {
        let prefix = telemetry_key(device_id, "");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TELEMETRY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: TelemetryRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if record.device_id == device_id {
                    results.push(record);
                }
            }
        }
        Ok(results)
    }

    fn keys_with_prefix(
        &self,
        definition: redb::TableDefinition<'static, &'static str, &'static [u8]>,
        prefix: &str,
    ) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(definition).map_err(map_err!(Table))?;
        let keys = table
            .iter()
            .map_err(map_err!(Read))?
            .filter_map(|entry| {
                let (key, _) = entry.ok()?;
                let k = key.value().to_string();
                k.starts_with(prefix).then_some(k)
            })
            .collect();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    // ── Devices ────────────────────────────────────────────────────

    #[test]
    fn provisioned_device_is_unknown_without_timestamps() {
        let store = test_store();
        store.provision_device("dev-1", Some("fleet-a"), 1_000).unwrap();

        let record = store.get_device("dev-1").unwrap().unwrap();
        assert_eq!(record.heartbeat, HeartbeatState::Unknown);
        assert_eq!(record.last_changed_at, None);
        assert_eq!(record.last_written_at, None);
        assert_eq!(record.group_id.as_deref(), Some("fleet-a"));
        assert_eq!(store.read_device_state("dev-1").unwrap(), HeartbeatState::Unknown);
    }

    #[test]
    fn provision_twice_fails() {
        let store = test_store();
        store.provision_device("dev-1", None, 1_000).unwrap();
        let err = store.provision_device("dev-1", None, 2_000).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(id) if id == "dev-1"));
    }

    #[test]
    fn read_state_of_missing_device_is_not_found() {
        let store = test_store();
        assert!(matches!(
            store.read_device_state("ghost"),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn list_and_delete_devices() {
        let store = test_store();
        store.provision_device("dev-1", None, 1).unwrap();
        store.provision_device("dev-2", None, 1).unwrap();
        assert_eq!(store.list_devices().unwrap().len(), 2);

        assert!(store.delete_device("dev-1").unwrap());
        assert!(!store.delete_device("dev-1").unwrap());
        assert_eq!(store.list_devices().unwrap().len(), 1);
    }

    #[test]
    fn delete_device_removes_its_telemetry_only() {
        let store = test_store();
        store.provision_device("dev-1", None, 1).unwrap();
        store.provision_device("dev-10", None, 1).unwrap();
        for device_id in ["dev-1", "dev-10"] {
            store
                .put_telemetry(&TelemetryRecord {
                    device_id: device_id.to_string(),
                    kind: "battery".to_string(),
                    value: json!(80),
                    recorded_at: 5,
                })
                .unwrap();
        }

        store.delete_device("dev-1").unwrap();
        assert!(store.get_telemetry("dev-1", "battery").unwrap().is_none());
        assert!(store.get_telemetry("dev-10", "battery").unwrap().is_some());
    }

    // ── Heartbeat writes ───────────────────────────────────────────

    #[test]
    fn apply_changes_state_and_stamps_change_time() {
        let store = test_store();
        store.provision_device("dev-1", None, 1_000).unwrap();

        let outcome = store
            .apply_heartbeat("dev-1", HeartbeatState::Online, 2_000)
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Changed {
                old: HeartbeatState::Unknown,
                new: HeartbeatState::Online,
                changed_at: 2_000,
            }
        );

        let record = store.get_device("dev-1").unwrap().unwrap();
        assert_eq!(record.heartbeat, HeartbeatState::Online);
        assert_eq!(record.last_changed_at, Some(2_000));
        assert_eq!(record.last_written_at, Some(2_000));
    }

    #[test]
    fn apply_same_state_only_moves_write_time() {
        let store = test_store();
        store.provision_device("dev-1", None, 1_000).unwrap();
        store
            .apply_heartbeat("dev-1", HeartbeatState::Online, 2_000)
            .unwrap();

        let outcome = store
            .apply_heartbeat("dev-1", HeartbeatState::Online, 3_000)
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Unchanged {
                last_changed_at: Some(2_000)
            }
        );

        let record = store.get_device("dev-1").unwrap().unwrap();
        assert_eq!(record.last_changed_at, Some(2_000));
        assert_eq!(record.last_written_at, Some(3_000));
    }

    #[test]
    fn apply_older_write_is_rejected() {
        let store = test_store();
        store.provision_device("dev-1", None, 1_000).unwrap();
        store
            .apply_heartbeat("dev-1", HeartbeatState::Online, 5_000)
            .unwrap();

        let outcome = store
            .apply_heartbeat("dev-1", HeartbeatState::Offline, 4_000)
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Rejected {
                stored_written_at: 5_000
            }
        );
        assert_eq!(store.read_device_state("dev-1").unwrap(), HeartbeatState::Online);
    }

    #[test]
    fn apply_at_equal_timestamp_is_accepted() {
        let store = test_store();
        store.provision_device("dev-1", None, 1_000).unwrap();
        store
            .apply_heartbeat("dev-1", HeartbeatState::Online, 5_000)
            .unwrap();
        let outcome = store
            .apply_heartbeat("dev-1", HeartbeatState::Timeout, 5_000)
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Changed { .. }));
    }

    #[test]
    fn apply_to_missing_device_is_not_found() {
        let store = test_store();
        let err = store
            .apply_heartbeat("ghost", HeartbeatState::Online, 1)
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
        assert!(store.get_device("ghost").unwrap().is_none());
    }

    // ── Config ─────────────────────────────────────────────────────

    #[test]
    fn config_scopes_are_isolated() {
        let store = test_store();
        let group = ConfigScope::Group("fleet-a".to_string());
        let device = ConfigScope::Device("dev-1".to_string());

        store
            .put_config(&ConfigScope::System, "poll_interval_ms", json!(60_000), 1)
            .unwrap();
        store
            .put_config(&group, "poll_interval_ms", json!(120_000), 1)
            .unwrap();

        assert_eq!(
            store.get_config(&ConfigScope::System, "poll_interval_ms").unwrap(),
            Some(json!(60_000))
        );
        assert_eq!(
            store.get_config(&group, "poll_interval_ms").unwrap(),
            Some(json!(120_000))
        );
        assert_eq!(store.get_config(&device, "poll_interval_ms").unwrap(), None);
    }

    #[test]
    fn config_null_is_distinct_from_absent() {
        let store = test_store();
        let device = ConfigScope::Device("dev-1".to_string());
        store
            .put_config(&device, "online_update_cache_timeout_ms", serde_json::Value::Null, 1)
            .unwrap();

        assert_eq!(
            store
                .get_config(&device, "online_update_cache_timeout_ms")
                .unwrap(),
            Some(serde_json::Value::Null)
        );
        assert!(store.delete_config(&device, "online_update_cache_timeout_ms").unwrap());
        assert_eq!(
            store
                .get_config(&device, "online_update_cache_timeout_ms")
                .unwrap(),
            None
        );
    }

    #[test]
    fn list_config_for_scope() {
        let store = test_store();
        let device = ConfigScope::Device("dev-1".to_string());
        let other = ConfigScope::Device("dev-10".to_string());
        store.put_config(&device, "a", json!(1), 1).unwrap();
        store.put_config(&device, "b", json!(2), 1).unwrap();
        store.put_config(&other, "a", json!(3), 1).unwrap();

        let entries = store.list_config(&device).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.scope == device));
    }

    // ── Telemetry ──────────────────────────────────────────────────

    #[test]
    fn telemetry_put_get_list() {
        let store = test_store();
        let battery = TelemetryRecord {
            device_id: "dev-1".to_string(),
            kind: "battery".to_string(),
            value: json!({"percent": 71}),
            recorded_at: 10,
        };
        let disk = TelemetryRecord {
            kind: "disk".to_string(),
            value: json!(0.4),
            ..battery.clone()
        };
        store.put_telemetry(&battery).unwrap();
        store.put_telemetry(&disk).unwrap();

        assert_eq!(
            store.get_telemetry("dev-1", "battery").unwrap(),
            Some(battery)
        );
        assert_eq!(store.list_telemetry("dev-1").unwrap().len(), 2);
        assert!(store.list_telemetry("dev-2").unwrap().is_empty());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartwatch.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.provision_device("dev-1", None, 1).unwrap();
            store
                .apply_heartbeat("dev-1", HeartbeatState::Online, 7)
                .unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let record = store.get_device("dev-1").unwrap().unwrap();
        assert_eq!(record.heartbeat, HeartbeatState::Online);
        assert_eq!(record.last_changed_at, Some(7));
    }
}
