//! HeartbeatTracker: the heartbeat state machine.
//!
//! `Unknown → Online → Timeout → Offline`, with any heartbeat forcing
//! `Online` again. A heartbeat that finds a fresh `Online` entry in the
//! shared cache skips the durable write. Every heartbeat re-arms the
//! `Online → Timeout` downgrade under a new generation; applying `Timeout`
//! arms `Timeout → Offline`. Fired downgrades are re-validated against the
//! cache (or, when the entry is gone, the durable record) before they are
//! applied, so a lost cancellation only costs a discarded message.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use heartwatch_cache::SharedCache;
use heartwatch_core::{Clock, DeviceId, HeartbeatState, HeartwatchConfig};
use heartwatch_queue::DelayedQueue;
use heartwatch_state::{ApplyOutcome, DeviceRecord, StateStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{TrackerError, TrackerResult};
use crate::events::{EventBus, StatsEvent, TrackerEvent};
use crate::persister::StatePersister;
use crate::resolver::{DeviceSettings, PollIntervalResolver};
use crate::stats::TrackerStats;
use crate::transitions::{DelayedTransitionQueue, ScheduledTransition};
use crate::write_through::{CacheEntry, WriteThroughCache};

/// Delay before a transition that failed on infrastructure is retried.
pub const REDELIVERY_DELAY: Duration = Duration::from_secs(1);

/// Something that happened to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub device_id: DeviceId,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Heartbeat,
    /// A scheduled downgrade came due.
    DownscaleFired {
        target_state: HeartbeatState,
        generation: u64,
        scheduled_at: u64,
    },
}

impl From<ScheduledTransition> for InboundEvent {
    fn from(transition: ScheduledTransition) -> Self {
        Self {
            device_id: transition.device_id,
            kind: EventKind::DownscaleFired {
                target_state: transition.target_state,
                generation: transition.generation,
                scheduled_at: transition.scheduled_at,
            },
        }
    }
}

/// What the tracker did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A durable write was attempted.
    Persisted(ApplyOutcome),
    /// A fresh cache entry made the durable write unnecessary.
    Skipped,
    /// A fired downgrade no longer matched the device and was dropped.
    Stale,
}

/// Next generation token after `previous`.
///
/// Tokens are derived from the clock so a chain restarted after the cache
/// entry was lost does not reuse a recent generation.
pub fn next_generation(previous: Option<u64>, now_ms: u64) -> u64 {
    let floor = now_ms.saturating_mul(1_000);
    match previous {
        Some(previous) => floor.max(previous.saturating_add(1)),
        None => floor,
    }
}

pub struct HeartbeatTracker {
    clock: Arc<dyn Clock>,
    resolver: PollIntervalResolver,
    cache: WriteThroughCache,
    transitions: DelayedTransitionQueue,
    persister: StatePersister,
    events: Arc<EventBus>,
    stats: Arc<TrackerStats>,
    stats_interval: Duration,
    window_started: AtomicU64,
}

impl HeartbeatTracker {
    pub fn new(
        store: StateStore,
        cache: Arc<dyn SharedCache>,
        queue: Arc<dyn DelayedQueue>,
        clock: Arc<dyn Clock>,
        config: &HeartwatchConfig,
    ) -> Self {
        let io_timeout = config.io_timeout();
        let events = Arc::new(EventBus::new());
        let stats = Arc::new(TrackerStats::default());
        Self {
            resolver: PollIntervalResolver::new(
                store.clone(),
                config.heartbeat.clone(),
                clock.clone(),
                Duration::from_millis(config.resolver.cache_ttl_ms),
            ),
            cache: WriteThroughCache::new(cache, io_timeout),
            transitions: DelayedTransitionQueue::new(queue, clock.clone(), io_timeout),
            persister: StatePersister::new(store, events.clone(), stats.clone()),
            window_started: AtomicU64::new(clock.now_ms()),
            stats_interval: config.stats_interval(),
            clock,
            events,
            stats,
        }
    }

    /// Record a heartbeat for a device.
    pub async fn capture_heartbeat(&self, device_id: &str) -> TrackerResult<Decision> {
        self.handle(InboundEvent {
            device_id: device_id.to_string(),
            kind: EventKind::Heartbeat,
        })
        .await
    }

    /// Effective poll interval in milliseconds.
    pub fn effective_poll_interval(&self, device_id: &str) -> TrackerResult<u64> {
        self.resolver.resolve(device_id)
    }

    /// Durable record for a device.
    pub fn device_status(&self, device_id: &str) -> TrackerResult<DeviceRecord> {
        self.persister
            .store()
            .get_device(device_id)?
            .ok_or_else(|| TrackerError::UnknownDevice(device_id.to_string()))
    }

    /// Drop instance and cache state for a device removed from the store.
    ///
    /// Downgrades still pending for it fail validation when they fire.
    pub async fn forget(&self, device_id: &str) -> TrackerResult<()> {
        self.resolver.invalidate(device_id);
        self.cache.delete(device_id).await?;
        debug!(%device_id, "device forgotten");
        Ok(())
    }

    pub fn resolver(&self) -> &PollIntervalResolver {
        &self.resolver
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TrackerEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> StatsEvent {
        let now = self.clock.now_ms();
        self.stats
            .snapshot(now.saturating_sub(self.window_started.load(Ordering::Relaxed)))
    }

    pub async fn handle(&self, event: InboundEvent) -> TrackerResult<Decision> {
        match event.kind {
            EventKind::Heartbeat => self.on_heartbeat(&event.device_id).await,
            EventKind::DownscaleFired {
                target_state,
                generation,
                scheduled_at,
            } => {
                self.on_downscale(&event.device_id, target_state, generation, scheduled_at)
                    .await
            }
        }
    }

    async fn on_heartbeat(&self, device_id: &str) -> TrackerResult<Decision> {
        let settings = self.resolver.resolve_settings(device_id)?;
        let now = self.clock.now_ms();
        let cached = self.cache.get(device_id).await?;

        if let Some(entry) = cached.as_ref().filter(|e| is_fresh_online(e, &settings, now)) {
            let generation = next_generation(Some(entry.generation), now);
            self.arm(device_id, HeartbeatState::Timeout, settings.poll_interval, generation)
                .await?;
            let refreshed = CacheEntry {
                generation,
                ..entry.clone()
            };
            self.cache.set(&refreshed, settings.cache_ttl).await?;
            self.stats.record_skipped();
            self.cancel_superseded(device_id, entry.generation).await;
            debug!(%device_id, generation, "heartbeat absorbed by cache");
            return Ok(Decision::Skipped);
        }

        // Arm first: a stored `Online` always has a downgrade pending.
        if self.persister.store().get_device(device_id)?.is_none() {
            return Err(TrackerError::UnknownDevice(device_id.to_string()));
        }
        let previous = cached.as_ref().map(|e| e.generation);
        let generation = next_generation(previous, now);
        self.arm(device_id, HeartbeatState::Timeout, settings.poll_interval, generation)
            .await?;
        let outcome = match self.persister.apply(device_id, HeartbeatState::Online, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.cancel_superseded(device_id, generation).await;
                return Err(e);
            }
        };
        if matches!(outcome, ApplyOutcome::Rejected { .. }) {
            self.cancel_superseded(device_id, generation).await;
            return Ok(Decision::Persisted(outcome));
        }

        let entry = CacheEntry {
            device_id: device_id.to_string(),
            current_state: HeartbeatState::Online,
            written_at: now,
            generation,
        };
        self.cache.set(&entry, settings.cache_ttl).await?;
        if let Some(previous) = previous {
            self.cancel_superseded(device_id, previous).await;
        }
        debug!(%device_id, generation, ?outcome, "heartbeat persisted");
        Ok(Decision::Persisted(outcome))
    }

    async fn on_downscale(
        &self,
        device_id: &str,
        target: HeartbeatState,
        generation: u64,
        scheduled_at: u64,
    ) -> TrackerResult<Decision> {
        self.stats.record_fired();
        let Some(expected) = target.predecessor() else {
            warn!(%device_id, %target, "ignoring transition to a non-downgrade state");
            self.stats.record_stale();
            return Ok(Decision::Stale);
        };

        let current = match self.cache.get(device_id).await? {
            Some(entry) => entry.generation == generation && entry.current_state == expected,
            // Without a cache entry the durable record decides: it must still
            // hold the expected state and nothing newer may have been written.
            None => match self.persister.store().get_device(device_id)? {
                Some(record) => {
                    record.heartbeat == expected
                        && record.last_written_at.is_none_or(|w| w <= scheduled_at)
                }
                None => false,
            },
        };
        if !current {
            self.stats.record_stale();
            debug!(%device_id, %target, generation, "stale transition discarded");
            return Ok(Decision::Stale);
        }

        let settings = self.resolver.resolve_settings(device_id)?;
        let now = self.clock.now_ms();

        // A stored `Timeout` always has its `Offline` already armed.
        let follow_up = match target {
            HeartbeatState::Timeout => {
                let next = next_generation(Some(generation), now);
                self.arm(device_id, HeartbeatState::Offline, settings.timeout_grace, next)
                    .await?;
                Some(next)
            }
            _ => None,
        };
        let outcome = match self.persister.apply(device_id, target, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(next) = follow_up {
                    self.cancel_superseded(device_id, next).await;
                }
                return Err(e);
            }
        };
        if matches!(outcome, ApplyOutcome::Rejected { .. }) {
            if let Some(next) = follow_up {
                self.cancel_superseded(device_id, next).await;
            }
            return Ok(Decision::Persisted(outcome));
        }

        match follow_up {
            Some(next) => {
                let entry = CacheEntry {
                    device_id: device_id.to_string(),
                    current_state: HeartbeatState::Timeout,
                    written_at: now,
                    generation: next,
                };
                self.cache.set(&entry, settings.cache_ttl).await?;
            }
            None => {
                // Offline is terminal until the next heartbeat, which must
                // then go through a durable write.
                self.cache.delete(device_id).await?;
            }
        }
        Ok(Decision::Persisted(outcome))
    }

    async fn arm(
        &self,
        device_id: &str,
        target: HeartbeatState,
        delay: Duration,
        generation: u64,
    ) -> TrackerResult<()> {
        self.transitions
            .schedule_after(device_id, target, delay, generation)
            .await?;
        self.stats.record_scheduled();
        Ok(())
    }

    async fn cancel_superseded(&self, device_id: &str, generation: u64) {
        if let Err(e) = self.transitions.cancel(device_id, generation).await {
            warn!(%device_id, generation, error = %e, "failed to cancel superseded transition");
        }
    }

    /// Publish the current stats window and start a new one.
    pub fn emit_stats(&self) -> StatsEvent {
        let now = self.clock.now_ms();
        let started = self.window_started.swap(now, Ordering::Relaxed);
        let window = self.stats.snapshot_and_reset(now.saturating_sub(started));
        self.events.publish(TrackerEvent::Stats(window));
        window
    }

    /// Drain fired transitions until shutdown or until the queue closes.
    ///
    /// Each transition is handled in its own task so one slow device never
    /// holds up another. In-flight tasks are awaited before returning. A
    /// transition that fails on unreachable infrastructure is handed back
    /// to the queue and retried after [`REDELIVERY_DELAY`].
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("transition consumer started");
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                next = self.transitions.next() => match next {
                    Ok(Some(transition)) => {
                        let tracker = self.clone();
                        tasks.spawn(async move { tracker.handle_fired(transition).await });
                    }
                    Ok(None) => {
                        info!("transition queue closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "transition consume failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "transition task failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("transition consumer shutting down");
                    break;
                }
            }
        }
        if !tasks.is_empty() {
            debug!(in_flight = tasks.len(), "waiting for in-flight transitions");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "transition task failed");
            }
        }
    }

    async fn handle_fired(&self, transition: ScheduledTransition) {
        let device_id = transition.device_id.clone();
        match self.handle(transition.clone().into()).await {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                warn!(%device_id, error = %e, "fired transition failed, redelivering");
                if let Err(e) = self
                    .transitions
                    .redeliver(&transition, REDELIVERY_DELAY)
                    .await
                {
                    warn!(%device_id, error = %e, "failed to redeliver transition");
                }
            }
            Err(e) => warn!(%device_id, error = %e, "fired transition failed"),
        }
    }

    /// Emit a stats event every stats interval until shutdown.
    pub async fn run_stats(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.stats_interval.as_millis() as u64, "stats emitter started");
        let mut ticker = tokio::time::interval(self.stats_interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let window = self.emit_stats();
                    debug!(?window, "stats emitted");
                }
                _ = shutdown.changed() => {
                    info!("stats emitter shutting down");
                    break;
                }
            }
        }
    }

    /// Stop delivering transitions to every consumer of the queue.
    pub async fn close(&self) {
        self.transitions.close().await;
    }
}

/// Whether a cached entry lets a heartbeat skip the durable write.
fn is_fresh_online(entry: &CacheEntry, settings: &DeviceSettings, now: u64) -> bool {
    if entry.current_state != HeartbeatState::Online {
        return false;
    }
    match settings.online_update_cache_timeout {
        None => true,
        Some(limit) => now.saturating_sub(entry.written_at) < limit.as_millis() as u64,
    }
}
