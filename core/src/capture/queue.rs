use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{info, warn};

use super::CaptureItem;

/// Bounded FIFO between capture and the single log-writing consumer.
///
/// Producers never block: when full, the oldest item is dropped. One warning is raised per
/// overflow episode; the episode ends once the queue drains below the low-water mark.
pub struct CaptureQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    low_water_mark: usize,
}

#[derive(Default)]
struct QueueInner {
    items: VecDeque<CaptureItem>,
    in_flight: usize,
    overflowing: bool,
    overflow_warnings: u64,
    dropped_total: u64,
}

impl CaptureQueue {
    pub fn new(capacity: usize, low_water_mark: usize) -> Self {
        let capacity = capacity.max(1);
        Self { inner: Mutex::new(QueueInner::default()), notify: Notify::new(), capacity, low_water_mark: low_water_mark.min(capacity - 1) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        // nothing panics while holding this lock, so a poisoned guard still holds consistent data
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, item: CaptureItem) {
        {
            let mut inner = self.lock();
            if inner.items.len() >= self.capacity {
                if let Some(dropped) = inner.items.pop_front() {
                    inner.dropped_total += 1;
                    if !inner.overflowing {
                        inner.overflowing = true;
                        inner.overflow_warnings += 1;
                        warn!(
                            "capture queue full ({} items); dropping oldest captured action {}",
                            self.capacity, dropped.action_type
                        );
                    }
                }
            }
            inner.items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Take the next item, counting it as in flight until [`CaptureQueue::complete`]
    pub fn try_pop(&self) -> Option<CaptureItem> {
        let mut inner = self.lock();
        let item = inner.items.pop_front()?;
        inner.in_flight += 1;
        if inner.overflowing && inner.items.len() < self.low_water_mark {
            inner.overflowing = false;
            info!("capture queue drained below {}; overflow warning re-armed", self.low_water_mark);
        }
        Some(item)
    }

    /// Wait for the next item. Cancel-safe: an item is only removed when this returns it.
    pub async fn recv(&self) -> CaptureItem {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Mark one popped item as durably written
    pub fn complete(&self) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    /// Empty and nothing in flight
    pub fn is_drained(&self) -> bool {
        let inner = self.lock();
        inner.items.is_empty() && inner.in_flight == 0
    }

    pub fn len(&self) -> usize { self.lock().items.len() }

    pub fn is_empty(&self) -> bool { self.lock().items.is_empty() }

    pub fn overflow_warnings(&self) -> u64 { self.lock().overflow_warnings }

    pub fn dropped_total(&self) -> u64 { self.lock().dropped_total }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::EntityChange;
    use oplog_proto::OpType;
    use serde_json::json;

    fn item(n: usize) -> CaptureItem {
        CaptureItem {
            action_type: format!("action-{n}"),
            changes: vec![EntityChange::new("TASK", &format!("t{n}"), OpType::Create, json!({}))],
            captured_at: n as i64,
        }
    }

    #[test]
    fn overflow_drops_oldest_and_warns_once() {
        let queue = CaptureQueue::new(1000, 500);
        for n in 0..1001 {
            queue.push(item(n));
        }
        assert_eq!(queue.len(), 1000);
        assert_eq!(queue.dropped_total(), 1);
        assert_eq!(queue.overflow_warnings(), 1);
        assert_eq!(queue.try_pop().unwrap().action_type, "action-1");

        // still in the same episode
        queue.push(item(2000));
        queue.push(item(2001));
        assert_eq!(queue.overflow_warnings(), 1);
        assert_eq!(queue.dropped_total(), 2);
    }

    #[test]
    fn warning_rearms_after_draining_below_low_water() {
        let queue = CaptureQueue::new(4, 2);
        for n in 0..5 {
            queue.push(item(n));
        }
        assert_eq!(queue.overflow_warnings(), 1);
        while queue.len() >= 2 {
            queue.try_pop();
            queue.complete();
        }
        for n in 10..15 {
            queue.push(item(n));
        }
        assert_eq!(queue.overflow_warnings(), 2);
    }

    #[test]
    fn drained_accounts_for_in_flight_items() {
        let queue = CaptureQueue::new(10, 5);
        queue.push(item(0));
        assert!(!queue.is_drained());
        let _taken = queue.try_pop();
        assert!(queue.is_empty());
        assert!(!queue.is_drained());
        queue.complete();
        assert!(queue.is_drained());
    }

    #[tokio::test]
    async fn recv_wakes_on_push() -> anyhow::Result<()> {
        let queue = std::sync::Arc::new(CaptureQueue::new(10, 5));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.push(item(7));
        let got = consumer.await?;
        assert_eq!(got.action_type, "action-7");
        Ok(())
    }
}
