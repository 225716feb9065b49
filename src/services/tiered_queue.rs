//! src/services/tiered_queue.rs
//!
//! TieredQueue — the in-process priority queue the worker drains.
//! Three FIFO tiers (high/medium/low) behind one mutex, with an async
//! notification so `pop_batch` can block until work arrives. Items whose
//! backoff gate has not elapsed are skipped in place, not removed.

use chrono::{Duration as ChronoDuration, Utc};
use std::{
    collections::VecDeque,
    sync::Mutex,
    time::Duration,
};
use tokio::sync::Notify;

use crate::models::work_item::{Priority, WorkItem};

/// Per-tier queue depths, highest tier first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TierDepths {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl TierDepths {
    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }
}

#[derive(Default)]
struct Tiers {
    high: VecDeque<WorkItem>,
    medium: VecDeque<WorkItem>,
    low: VecDeque<WorkItem>,
}

impl Tiers {
    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<WorkItem> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Medium => &mut self.medium,
            Priority::Low => &mut self.low,
        }
    }
}

/// Three-tier FIFO queue with blocking pop.
///
/// Pop order is strict: every eligible high item leaves before any medium
/// item, and every eligible medium item before any low item. Within a
/// tier, FIFO order holds except that an item deferred by its backoff
/// gate may be overtaken by eligible items behind it.
pub struct TieredQueue {
    inner: Mutex<Tiers>,
    notify: Notify,
    backoff_step: ChronoDuration,
}

impl TieredQueue {
    /// Create an empty queue. `backoff_step` is the per-retry delay unit:
    /// an item with n failures is gated for `backoff_step * n` after its
    /// last attempt.
    pub fn new(backoff_step: ChronoDuration) -> Self {
        Self {
            inner: Mutex::new(Tiers::default()),
            notify: Notify::new(),
            backoff_step,
        }
    }

    /// Append an item to its priority tier and wake a blocked popper.
    pub fn push(&self, item: WorkItem) {
        {
            let mut tiers = self.inner.lock().expect("tiered queue mutex poisoned");
            tiers.tier_mut(item.priority).push_back(item);
        }
        self.notify.notify_one();
    }

    /// Pop up to `max` eligible items, highest tier drained first.
    ///
    /// Blocks up to `timeout` waiting for the queue to become non-empty.
    /// Returns an empty vec on timeout, which is also how callers get a
    /// chance to re-check items whose backoff gate expires while the
    /// queue is otherwise idle.
    pub async fn pop_batch(&self, max: usize, timeout: Duration) -> Vec<WorkItem> {
        let popped = self.drain_eligible(max);
        if !popped.is_empty() {
            return popped;
        }

        // Nothing eligible right now; wait for a push or the timeout.
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        self.drain_eligible(max)
    }

    fn drain_eligible(&self, max: usize) -> Vec<WorkItem> {
        let now = Utc::now();
        let mut out = Vec::new();
        let mut tiers = self.inner.lock().expect("tiered queue mutex poisoned");

        for priority in Priority::ORDERED {
            let tier = tiers.tier_mut(priority);
            let mut kept = VecDeque::with_capacity(tier.len());
            while let Some(item) = tier.pop_front() {
                if out.len() < max && item.eligible_at(now, self.backoff_step) {
                    out.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *tier = kept;
        }

        out
    }

    /// Snapshot of per-tier queue lengths.
    pub fn depths(&self) -> TierDepths {
        let tiers = self.inner.lock().expect("tiered queue mutex poisoned");
        TierDepths {
            high: tiers.high.len(),
            medium: tiers.medium.len(),
            low: tiers.low.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(template: &str, priority: Priority) -> WorkItem {
        WorkItem::new(template.into(), vec![], priority)
    }

    fn queue() -> TieredQueue {
        TieredQueue::new(ChronoDuration::seconds(5))
    }

    #[tokio::test]
    async fn higher_tier_drains_first() {
        let q = queue();
        q.push(item("a", Priority::Low));
        q.push(item("b", Priority::High));
        q.push(item("c", Priority::Medium));
        q.push(item("d", Priority::High));

        let batch = q.pop_batch(10, Duration::from_millis(10)).await;
        let tiers: Vec<Priority> = batch.iter().map(|i| i.priority).collect();
        assert_eq!(
            tiers,
            vec![
                Priority::High,
                Priority::High,
                Priority::Medium,
                Priority::Low
            ]
        );
        // FIFO within the high tier.
        assert_eq!(batch[0].template, "b");
        assert_eq!(batch[1].template, "d");
    }

    #[tokio::test]
    async fn batch_limit_leaves_lower_tiers_queued() {
        let q = queue();
        q.push(item("a", Priority::High));
        q.push(item("b", Priority::High));
        q.push(item("c", Priority::Low));

        let batch = q.pop_batch(2, Duration::from_millis(10)).await;
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|i| i.priority == Priority::High));

        let depths = q.depths();
        assert_eq!(depths.high, 0);
        assert_eq!(depths.low, 1);
    }

    #[tokio::test]
    async fn gated_item_is_deferred_not_lost() {
        let q = queue();
        let mut gated = item("a", Priority::High);
        gated.record_failure(Utc::now());
        q.push(gated);
        q.push(item("b", Priority::Low));

        // The high item is inside its backoff window; the low item pops.
        let batch = q.pop_batch(10, Duration::from_millis(10)).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].template, "b");
        assert_eq!(q.depths().high, 1);
    }

    #[tokio::test]
    async fn pop_times_out_empty() {
        let q = queue();
        let batch = q.pop_batch(10, Duration::from_millis(20)).await;
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = std::sync::Arc::new(queue());
        let popper = {
            let q = q.clone();
            tokio::spawn(async move { q.pop_batch(10, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(item("a", Priority::Medium));

        let batch = popper.await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].template, "a");
    }
}
