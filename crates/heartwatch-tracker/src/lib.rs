//! heartwatch-tracker: device liveness from heartbeats.
//!
//! The [`HeartbeatTracker`] turns heartbeats into durable `Online` /
//! `Timeout` / `Offline` state while keeping durable writes to a minimum:
//!
//! - [`PollIntervalResolver`] resolves per-device settings from layered config.
//! - [`WriteThroughCache`] holds the last-known state in the shared cache so
//!   any instance can skip writes someone else already made.
//! - [`DelayedTransitionQueue`] arms the downgrades that fire when a device
//!   goes quiet.
//! - [`StatePersister`] performs the guarded durable write and publishes
//!   change events.
//! - [`ReportThrottle`] applies the same cache gate to telemetry reports.
//!
//! Instances coordinate only through the shared cache, shared queue and
//! durable store.

pub mod error;
pub mod events;
pub mod persister;
pub mod resolver;
pub mod stats;
pub mod throttle;
pub mod tracker;
pub mod transitions;
pub mod write_through;

pub use error::{TrackerError, TrackerResult};
pub use events::{ChangeEvent, EventBus, StatsEvent, TrackerEvent};
pub use persister::StatePersister;
pub use resolver::{DeviceSettings, PollIntervalResolver};
pub use stats::TrackerStats;
pub use throttle::ReportThrottle;
pub use tracker::{Decision, EventKind, HeartbeatTracker, InboundEvent, next_generation};
pub use transitions::{DelayedTransitionQueue, ScheduledTransition};
pub use write_through::{CacheEntry, WriteThroughCache};
