use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::types::DeliveryId;

/// Deliveries waiting for their next attempt, ordered by due time.
///
/// A delivery is scheduled at most once: rescheduling replaces the earlier
/// due time, and the superseded heap entry is skipped when it surfaces.
#[derive(Default)]
pub struct DueQueue {
    state: Mutex<DueState>,
    notify: Notify,
    closed: AtomicBool,
}

#[derive(Default)]
struct DueState {
    heap: BinaryHeap<Scheduled>,
    scheduled: HashMap<DeliveryId, Instant>,
}

impl DueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn schedule(&self, id: DeliveryId, delay: Duration) {
        self.schedule_instant(id, Instant::now() + delay).await;
    }

    pub async fn schedule_now(&self, id: DeliveryId) {
        self.schedule_instant(id, Instant::now()).await;
    }

    /// Schedule for a wall-clock time. Times in the past are due immediately.
    pub async fn schedule_at(&self, id: DeliveryId, at: DateTime<Utc>) {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule(id, delay).await;
    }

    async fn schedule_instant(&self, id: DeliveryId, ready_at: Instant) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().await;
        state.scheduled.insert(id.clone(), ready_at);
        state.heap.push(Scheduled { ready_at, id });
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next due delivery. Returns `None` once closed.
    pub async fn next_due(&self) -> Option<DeliveryId> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let mut wake_at = None;
                while let Some(head) = state.heap.peek() {
                    // Superseded entry.
                    if state.scheduled.get(&head.id) != Some(&head.ready_at) {
                        state.heap.pop();
                        continue;
                    }
                    if head.ready_at <= now {
                        let id = head.id.clone();
                        state.heap.pop();
                        state.scheduled.remove(&id);
                        // Let another waiter look at the rest of the heap.
                        if !state.heap.is_empty() {
                            self.notify.notify_one();
                        }
                        return Some(id);
                    }
                    wake_at = Some(head.ready_at);
                    break;
                }
                wake_at
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Wake every waiter and stop handing out work.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Deliveries currently scheduled.
    pub async fn len(&self) -> usize {
        self.state.lock().await.scheduled.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

struct Scheduled {
    ready_at: Instant,
    id: DeliveryId,
}

impl Eq for Scheduled {}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
