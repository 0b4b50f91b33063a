//! Min-ordered priority queue over `(scheduled_for, -priority)`.
//!
//! Used by the manager to decide which run to dispatch next. Entries that
//! share a `scheduled_for` timestamp are ordered by priority, higher first.
//! `remove` is O(n) — per the spec this is rare (pause/cancel of a queued,
//! not-yet-dispatched run) and a linear scan is acceptable.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::QueueError;

/// A single pending dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub priority: i32,
    /// Epoch-ms at which this entry becomes eligible for dispatch.
    pub scheduled_for: i64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.scheduled_for == other.scheduled_for && self.priority == other.priority
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// `BinaryHeap` is a max-heap, so we invert the natural "earliest wins"
    /// comparison: the entry that should be dequeued first compares as
    /// *greater*.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .scheduled_for
            .cmp(&self.scheduled_for)
            .then_with(|| self.priority.cmp(&other.priority))
    }
}

/// Thread-safe binary-heap queue of pending run dispatches.
pub struct PriorityQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn enqueue(&self, entry: QueueEntry) {
        self.heap.lock().push(entry);
    }

    /// Remove and return the single most eligible entry, if any.
    pub fn dequeue(&self) -> Option<QueueEntry> {
        self.heap.lock().pop()
    }

    /// Look at the most eligible entry without removing it.
    pub fn peek(&self) -> Option<QueueEntry> {
        self.heap.lock().peek().cloned()
    }

    pub fn size(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn clear(&self) {
        self.heap.lock().clear();
    }

    /// Drain and return every entry whose `scheduled_for <= now`, in heap
    /// (most-eligible-first) order.
    pub fn get_ready(&self, now: i64) -> Vec<QueueEntry> {
        let mut heap = self.heap.lock();
        let mut ready = Vec::new();
        while let Some(top) = heap.peek() {
            if top.scheduled_for > now {
                break;
            }
            ready.push(heap.pop().expect("peeked entry must pop"));
        }
        ready
    }

    /// O(n) removal of a specific run's queue entry, used by pause/cancel.
    pub fn remove(&self, run_id: Uuid) -> Result<QueueEntry, QueueError> {
        let mut heap = self.heap.lock();
        let items: Vec<QueueEntry> = std::mem::take(&mut *heap).into_vec();
        let mut removed = None;
        let mut rebuilt = BinaryHeap::with_capacity(items.len());
        for item in items {
            if removed.is_none() && item.run_id == run_id {
                removed = Some(item);
            } else {
                rebuilt.push(item);
            }
        }
        *heap = rebuilt;
        removed.ok_or(QueueError::NotFound(run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(run_id: Uuid, scheduled_for: i64, priority: i32) -> QueueEntry {
        QueueEntry {
            run_id,
            workflow_name: "wf".into(),
            priority,
            scheduled_for,
        }
    }

    #[test]
    fn earlier_scheduled_for_wins_regardless_of_priority() {
        let q = PriorityQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.enqueue(entry(a, 100, 0));
        q.enqueue(entry(b, 50, -100));
        let first = q.dequeue().unwrap();
        assert_eq!(first.run_id, b);
    }

    #[test]
    fn tied_scheduled_for_breaks_on_higher_priority() {
        let q = PriorityQueue::new();
        let low = Uuid::new_v4();
        let high = Uuid::new_v4();
        q.enqueue(entry(low, 100, 1));
        q.enqueue(entry(high, 100, 5));
        let first = q.dequeue().unwrap();
        assert_eq!(first.run_id, high);
    }

    #[test]
    fn get_ready_drains_only_due_entries() {
        let q = PriorityQueue::new();
        let due = Uuid::new_v4();
        let future = Uuid::new_v4();
        q.enqueue(entry(due, 10, 0));
        q.enqueue(entry(future, 1_000, 0));
        let ready = q.get_ready(20);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].run_id, due);
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn remove_by_id_is_idempotent_failure_on_second_call() {
        let q = PriorityQueue::new();
        let id = Uuid::new_v4();
        q.enqueue(entry(id, 10, 0));
        assert!(q.remove(id).is_ok());
        assert!(q.remove(id).is_err());
    }

    proptest::proptest! {
        #[test]
        fn dequeue_order_respects_scheduled_for(
            mut entries in proptest::collection::vec((0i64..1000, -10i32..10), 1..50)
        ) {
            let q = PriorityQueue::new();
            for (sf, pr) in &entries {
                q.enqueue(entry(Uuid::new_v4(), *sf, *pr));
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
            let mut popped = Vec::new();
            while let Some(e) = q.dequeue() {
                popped.push((e.scheduled_for, e.priority));
            }
            proptest::prop_assert_eq!(popped, entries);
        }
    }
}
