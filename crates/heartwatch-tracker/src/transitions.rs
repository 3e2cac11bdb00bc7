//! Scheduled state downgrades over the shared delayed queue.
//!
//! Each message is keyed by device and generation, so cancelling names one
//! exact schedule. Cancellation is advisory: a consumer always re-validates
//! a fired transition before acting on it.

use std::sync::Arc;
use std::time::Duration;

use heartwatch_core::{Clock, DeviceId, HeartbeatState, duration_ms};
use heartwatch_queue::DelayedQueue;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{TrackerResult, bounded};

/// A downgrade armed for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTransition {
    pub device_id: DeviceId,
    /// Generation current when this was scheduled.
    pub generation: u64,
    pub target_state: HeartbeatState,
    /// Epoch ms when the schedule was made.
    pub scheduled_at: u64,
    /// Epoch ms when the transition becomes due.
    pub fire_at: u64,
}

#[derive(Clone)]
pub struct DelayedTransitionQueue {
    queue: Arc<dyn DelayedQueue>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl DelayedTransitionQueue {
    pub fn new(queue: Arc<dyn DelayedQueue>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            queue,
            clock,
            timeout,
        }
    }

    pub fn key(device_id: &str, generation: u64) -> String {
        format!("transition:{device_id}:{generation}")
    }

    /// Arm `target_state` for a device after `delay`.
    pub async fn schedule_after(
        &self,
        device_id: &str,
        target_state: HeartbeatState,
        delay: Duration,
        generation: u64,
    ) -> TrackerResult<ScheduledTransition> {
        let scheduled_at = self.clock.now_ms();
        let transition = ScheduledTransition {
            device_id: device_id.to_string(),
            generation,
            target_state,
            scheduled_at,
            fire_at: scheduled_at.saturating_add(duration_ms(delay)),
        };
        let payload = serde_json::to_string(&transition)?;
        bounded(
            "queue enqueue",
            self.timeout,
            self.queue
                .enqueue_after(&Self::key(device_id, generation), payload, delay),
        )
        .await?;
        debug!(%device_id, %target_state, generation, fire_at = transition.fire_at, "transition scheduled");
        Ok(transition)
    }

    /// Put a fired transition back under its own key, due after `delay`.
    ///
    /// `scheduled_at` and the generation are kept, so the retry is
    /// validated exactly like the original delivery.
    pub async fn redeliver(
        &self,
        transition: &ScheduledTransition,
        delay: Duration,
    ) -> TrackerResult<ScheduledTransition> {
        let retry = ScheduledTransition {
            fire_at: self.clock.now_ms().saturating_add(duration_ms(delay)),
            ..transition.clone()
        };
        let payload = serde_json::to_string(&retry)?;
        bounded(
            "queue enqueue",
            self.timeout,
            self.queue.enqueue_after(
                &Self::key(&retry.device_id, retry.generation),
                payload,
                delay,
            ),
        )
        .await?;
        debug!(device_id = %retry.device_id, generation = retry.generation, "transition redelivered");
        Ok(retry)
    }

    /// Best-effort removal of a pending transition.
    pub async fn cancel(&self, device_id: &str, generation: u64) -> TrackerResult<bool> {
        bounded(
            "queue cancel",
            self.timeout,
            self.queue.cancel(&Self::key(device_id, generation)),
        )
        .await
    }

    /// Wait for the next fired transition; `None` once the queue is closed.
    ///
    /// Messages that fail to decode are dropped with a warning.
    pub async fn next(&self) -> TrackerResult<Option<ScheduledTransition>> {
        loop {
            let Some(delivery) = self.queue.consume().await? else {
                return Ok(None);
            };
            match serde_json::from_str(&delivery.payload) {
                Ok(transition) => return Ok(Some(transition)),
                Err(err) => {
                    warn!(key = %delivery.key, error = %err, "dropping undecodable transition");
                }
            }
        }
    }

    pub async fn close(&self) {
        self.queue.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heartwatch_core::SystemClock;
    use heartwatch_queue::MemoryDelayedQueue;

    fn transitions() -> (DelayedTransitionQueue, MemoryDelayedQueue, Arc<SystemClock>) {
        let clock = Arc::new(SystemClock::new());
        let memory = MemoryDelayedQueue::new(clock.clone());
        let queue = DelayedTransitionQueue::new(
            Arc::new(memory.clone()),
            clock.clone(),
            Duration::from_secs(1),
        );
        (queue, memory, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_transition_fires_after_delay() {
        let (queue, _, clock) = transitions();
        let start = clock.now_ms();
        let scheduled = queue
            .schedule_after("dev-1", HeartbeatState::Timeout, Duration::from_secs(90), 42)
            .await
            .unwrap();
        assert_eq!(scheduled.fire_at, start + 90_000);

        let fired = queue.next().await.unwrap().unwrap();
        assert_eq!(fired, scheduled);
        assert!(clock.now_ms() >= fired.fire_at);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_targets_one_generation() {
        let (queue, memory, _) = transitions();
        queue
            .schedule_after("dev-1", HeartbeatState::Timeout, Duration::from_secs(10), 1)
            .await
            .unwrap();
        queue
            .schedule_after("dev-1", HeartbeatState::Timeout, Duration::from_secs(20), 2)
            .await
            .unwrap();

        assert!(queue.cancel("dev-1", 1).await.unwrap());
        assert!(!memory.is_pending("transition:dev-1:1"));
        assert!(memory.is_pending("transition:dev-1:2"));
        assert_eq!(queue.next().await.unwrap().unwrap().generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_payload_is_skipped() {
        let (queue, memory, _) = transitions();
        memory
            .enqueue_after("junk", "{".into(), Duration::from_secs(1))
            .await
            .unwrap();
        queue
            .schedule_after("dev-1", HeartbeatState::Offline, Duration::from_secs(2), 5)
            .await
            .unwrap();

        let fired = queue.next().await.unwrap().unwrap();
        assert_eq!(fired.target_state, HeartbeatState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_keeps_generation_and_schedule_time() {
        let (queue, _, clock) = transitions();
        queue
            .schedule_after("dev-1", HeartbeatState::Timeout, Duration::from_secs(5), 9)
            .await
            .unwrap();
        let fired = queue.next().await.unwrap().unwrap();

        let retry = queue
            .redeliver(&fired, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(retry.fire_at, clock.now_ms() + 1_000);

        let again = queue.next().await.unwrap().unwrap();
        assert_eq!(again.generation, 9);
        assert_eq!(again.scheduled_at, fired.scheduled_at);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_queue_yields_none() {
        let (queue, _, _) = transitions();
        queue.close().await;
        assert_eq!(queue.next().await.unwrap(), None);
    }
}
