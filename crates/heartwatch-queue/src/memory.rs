//! In-process delayed queue over a time-ordered heap.
//!
//! Messages are ordered by due time, FIFO among equal due times. A
//! consumer sleeps until the earliest message is due and is woken early
//! when an earlier message is enqueued or the queue is closed.
//!
//! Cancelled or replaced messages stay in the heap as tombstones and are
//! skipped on pop. The queue can be built without cancellation support to
//! model delivery backends that cannot remove pending messages.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use heartwatch_core::{Clock, duration_ms};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::{DelayedQueue, Delivery, QueueError, QueueResult};

struct Pending {
    key: String,
    payload: String,
    due_at: u64,
}

struct Inner {
    /// (due_at, seq) min-heap.
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    /// Live messages by sequence number; heap entries missing here are tombstones.
    pending: HashMap<u64, Pending>,
    by_key: HashMap<String, u64>,
    next_seq: u64,
    closed: bool,
}

impl Inner {
    fn remove_key(&mut self, key: &str) -> bool {
        match self.by_key.remove(key) {
            Some(seq) => self.pending.remove(&seq).is_some(),
            None => false,
        }
    }

    /// Pop the earliest live message if due, otherwise return how long to wait.
    fn pop_due(&mut self, now: u64) -> Result<Delivery, Option<u64>> {
        while let Some(Reverse((due_at, seq))) = self.heap.peek().copied() {
            if !self.pending.contains_key(&seq) {
                self.heap.pop();
                continue;
            }
            if due_at > now {
                return Err(Some(due_at - now));
            }
            self.heap.pop();
            let Some(message) = self.pending.remove(&seq) else {
                continue;
            };
            if self.by_key.get(&message.key) == Some(&seq) {
                self.by_key.remove(&message.key);
            }
            return Ok(Delivery {
                key: message.key,
                payload: message.payload,
                due_at: message.due_at,
            });
        }
        Err(None)
    }
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
}

/// Thread-safe in-process [`DelayedQueue`].
#[derive(Clone)]
pub struct MemoryDelayedQueue {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    cancel_supported: bool,
}

impl MemoryDelayedQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    heap: BinaryHeap::new(),
                    pending: HashMap::new(),
                    by_key: HashMap::new(),
                    next_seq: 0,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
            clock,
            cancel_supported: true,
        }
    }

    /// Make `cancel` a no-op, as with backends that cannot remove messages.
    pub fn without_cancel(mut self) -> Self {
        self.cancel_supported = false;
        self
    }

    fn lock(&self) -> QueueResult<MutexGuard<'_, Inner>> {
        self.shared
            .inner
            .lock()
            .map_err(|_| QueueError::Unavailable("queue lock poisoned".to_string()))
    }

    /// Number of live (not cancelled, not delivered) messages.
    pub fn pending_len(&self) -> usize {
        self.lock().map(|inner| inner.pending.len()).unwrap_or(0)
    }

    /// Whether a live message exists for `key`.
    pub fn is_pending(&self, key: &str) -> bool {
        self.lock()
            .map(|inner| inner.by_key.contains_key(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl DelayedQueue for MemoryDelayedQueue {
    async fn enqueue_after(&self, key: &str, payload: String, delay: Duration) -> QueueResult<()> {
        let due_at = self
            .clock
            .now_ms()
            .saturating_add(duration_ms(delay));
        {
            let mut inner = self.lock()?;
            if inner.closed {
                return Err(QueueError::Closed);
            }
            inner.remove_key(key);
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Reverse((due_at, seq)));
            inner.pending.insert(
                seq,
                Pending {
                    key: key.to_string(),
                    payload,
                    due_at,
                },
            );
            inner.by_key.insert(key.to_string(), seq);
        }
        trace!(%key, due_at, "message enqueued");
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self) -> QueueResult<Option<Delivery>> {
        loop {
            // Register for wake-ups before inspecting the heap so an
            // enqueue between the check and the wait is not missed.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut inner = self.lock()?;
                if inner.closed {
                    return Ok(None);
                }
                match inner.pop_due(self.clock.now_ms()) {
                    Ok(delivery) => {
                        trace!(key = %delivery.key, "message delivered");
                        return Ok(Some(delivery));
                    }
                    Err(wait) => wait,
                }
            };

            match wait {
                Some(ms) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn cancel(&self, key: &str) -> QueueResult<bool> {
        if !self.cancel_supported {
            return Ok(false);
        }
        let removed = self.lock()?.remove_key(key);
        trace!(%key, removed, "message cancel");
        Ok(removed)
    }

    async fn close(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.closed = true;
        }
        self.shared.notify.notify_waiters();
        debug!("delayed queue closed");
    }
}
