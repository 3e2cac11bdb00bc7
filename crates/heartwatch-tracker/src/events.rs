//! Change and stats notifications.
//!
//! Each subscriber owns an unbounded channel, so publishing never waits on
//! a slow consumer. Subscribers whose receiver was dropped are pruned on
//! the next publish.

use std::sync::Mutex;

use heartwatch_core::{DeviceId, HeartbeatState};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

/// Emitted once per durable write that altered a device's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub device_id: DeviceId,
    pub old_state: HeartbeatState,
    pub new_state: HeartbeatState,
    pub changed_at: u64,
}

/// Counters for one stats window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsEvent {
    pub scheduled: u64,
    pub fired: u64,
    pub skipped: u64,
    pub stale: u64,
    pub persisted: u64,
    pub rejected: u64,
    pub window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerEvent {
    Change(ChangeEvent),
    Stats(StatsEvent),
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TrackerEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TrackerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    pub fn publish(&self, event: TrackerEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        trace!(subscribers = subscribers.len(), "event published");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}
