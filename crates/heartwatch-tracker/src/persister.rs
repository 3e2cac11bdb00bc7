//! Durable heartbeat writes and the change notifications they raise.

use std::sync::Arc;

use heartwatch_core::HeartbeatState;
use heartwatch_state::{ApplyOutcome, StateStore};
use tracing::{debug, info};

use crate::error::TrackerResult;
use crate::events::{ChangeEvent, EventBus, TrackerEvent};
use crate::stats::TrackerStats;

pub struct StatePersister {
    store: StateStore,
    events: Arc<EventBus>,
    stats: Arc<TrackerStats>,
}

impl StatePersister {
    pub fn new(store: StateStore, events: Arc<EventBus>, stats: Arc<TrackerStats>) -> Self {
        Self {
            store,
            events,
            stats,
        }
    }

    /// Write `state` for a device as observed at `observed_at`.
    ///
    /// A change event is published only when the stored value changed.
    /// Out-of-order writes come back as [`ApplyOutcome::Rejected`], not as
    /// an error.
    pub fn apply(
        &self,
        device_id: &str,
        state: HeartbeatState,
        observed_at: u64,
    ) -> TrackerResult<ApplyOutcome> {
        let outcome = self.store.apply_heartbeat(device_id, state, observed_at)?;
        match outcome {
            ApplyOutcome::Changed {
                old,
                new,
                changed_at,
            } => {
                self.stats.record_persisted();
                info!(%device_id, %old, %new, changed_at, "device state changed");
                self.events.publish(TrackerEvent::Change(ChangeEvent {
                    device_id: device_id.to_string(),
                    old_state: old,
                    new_state: new,
                    changed_at,
                }));
            }
            ApplyOutcome::Unchanged { .. } => {
                self.stats.record_persisted();
                debug!(%device_id, %state, "device state re-confirmed");
            }
            ApplyOutcome::Rejected { stored_written_at } => {
                self.stats.record_rejected();
                debug!(%device_id, %state, observed_at, stored_written_at, "stale write rejected");
            }
        }
        Ok(outcome)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }
}
