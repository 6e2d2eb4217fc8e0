//! Expiration scheduler: priority-ordered timeout tracking per cache
//! instance.
//!
//! A binary min-heap ordered by effective expiration time, paired with an
//! id→task index so rescheduling and cancellation are O(log n) arbitrary
//! deletes. Tasks live in a small arena and are recycled, matching the
//! entry pool's reuse discipline.
//!
//! Ties in expiration time are broken by id ordering, which makes sweep
//! output deterministic.
//!
//! The scheduler only decides *when* an entry expires. After a sweep the
//! caller performs the cache-level invalidation with cause `Timeout` or
//! `Inactive`; the scheduler never invalidates anything itself.

use std::collections::HashMap;
use std::time::Duration;

use crate::entry::CacheId;
use crate::error::CacheError;
use crate::time::Timestamp;

/// One id collected by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredEntry {
    /// The expired entry's id.
    pub id: CacheId,
    /// Whether the inactivity window fired rather than the explicit
    /// expiration.
    pub inactivity_timeout: bool,
}

/// One pending expiration.
#[derive(Debug)]
struct Task {
    id: CacheId,
    expiration: Timestamp,
    inactivity_timeout: bool,
    /// Position in the heap, maintained on every move.
    heap_index: usize,
}

/// Min-heap of pending expirations with an id lookup index.
#[derive(Debug, Default)]
pub struct ExpirationScheduler {
    /// Heap of task-arena indices, ordered by `(expiration, id)`.
    heap: Vec<u32>,
    /// Task arena; `None` slots are pooled in `free`.
    tasks: Vec<Option<Task>>,
    free: Vec<u32>,
    index: HashMap<CacheId, u32>,
}

impl ExpirationScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no task is pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.heap
            .first()
            .map(|&t| self.task(t).expiration)
    }

    /// Whether the id has a pending task.
    pub fn contains(&self, id: &CacheId) -> bool {
        self.index.contains_key(id)
    }

    /// Schedule (or reschedule) the expiration for `id`.
    ///
    /// With an inactivity window the effective time is
    /// `min(now + inactivity, expiration)`; the task is tagged as an
    /// inactivity timeout only when the window is the sooner bound. A
    /// pending task for the same id is deleted and reinserted, never
    /// merged, since its heap position depends on the key.
    pub fn schedule(
        &mut self,
        id: CacheId,
        expiration: Option<Timestamp>,
        inactivity: Option<Duration>,
        now: Timestamp,
    ) -> Result<(), CacheError> {
        let inactivity = inactivity.filter(|window| !window.is_zero());
        let (effective, inactivity_timeout) = match (inactivity, expiration) {
            (Some(window), Some(explicit)) => {
                let idle_deadline = now + window;
                if explicit <= idle_deadline {
                    (explicit, false)
                } else {
                    (idle_deadline, true)
                }
            }
            (Some(window), None) => (now + window, true),
            (None, Some(explicit)) => (explicit, false),
            (None, None) => {
                return Err(CacheError::InvalidArgument(
                    "neither expiration nor inactivity set",
                ))
            }
        };

        if let Some(&existing) = self.index.get(&id) {
            self.delete_task(existing);
        }

        let task = Task {
            id: id.clone(),
            expiration: effective,
            inactivity_timeout,
            heap_index: self.heap.len(),
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.tasks[slot as usize] = Some(task);
                slot
            }
            None => {
                self.tasks.push(Some(task));
                (self.tasks.len() - 1) as u32
            }
        };
        self.index.insert(id, slot);
        self.heap.push(slot);
        self.sift_up(self.heap.len() - 1);
        Ok(())
    }

    /// Reset the timer for `id` on read; identical to [`schedule`].
    ///
    /// [`schedule`]: ExpirationScheduler::schedule
    pub fn touch(
        &mut self,
        id: CacheId,
        expiration: Option<Timestamp>,
        inactivity: Option<Duration>,
        now: Timestamp,
    ) -> Result<(), CacheError> {
        self.schedule(id, expiration, inactivity, now)
    }

    /// Delete the pending task for `id`, if any.
    pub fn unschedule(&mut self, id: &CacheId) -> bool {
        match self.index.get(id).copied() {
            Some(slot) => {
                self.delete_task(slot);
                true
            }
            None => false,
        }
    }

    /// Pop every task whose expiration is `≤ now`.
    ///
    /// Runs in time proportional to the number of expired tasks, not the
    /// heap size. After the call the heap minimum, if any, is `> now`.
    pub fn sweep(&mut self, now: Timestamp) -> Vec<ExpiredEntry> {
        let mut expired = Vec::new();
        while let Some(&root) = self.heap.first() {
            if self.task(root).expiration > now {
                break;
            }
            let task = self.remove_at(0);
            expired.push(ExpiredEntry {
                id: task.id,
                inactivity_timeout: task.inactivity_timeout,
            });
        }
        expired
    }

    /// Drop all pending tasks, returning their storage to the pool.
    pub fn clear(&mut self) {
        for &slot in &self.heap {
            self.tasks[slot as usize] = None;
            self.free.push(slot);
        }
        self.heap.clear();
        self.index.clear();
    }

    // ── heap internals ──────────────────────────────────────────────────

    fn task(&self, slot: u32) -> &Task {
        self.tasks[slot as usize]
            .as_ref()
            .expect("heap references a live task")
    }

    fn less(&self, a: u32, b: u32) -> bool {
        let (ta, tb) = (self.task(a), self.task(b));
        (ta.expiration, &ta.id) < (tb.expiration, &tb.id)
    }

    fn set_heap_index(&mut self, slot: u32, pos: usize) {
        self.tasks[slot as usize]
            .as_mut()
            .expect("heap references a live task")
            .heap_index = pos;
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.less(self.heap[pos], self.heap[parent]) {
                self.heap.swap(pos, parent);
                self.set_heap_index(self.heap[pos], pos);
                pos = parent;
            } else {
                break;
            }
        }
        self.set_heap_index(self.heap[pos], pos);
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut smallest = pos;
            if left < self.heap.len() && self.less(self.heap[left], self.heap[smallest]) {
                smallest = left;
            }
            if right < self.heap.len() && self.less(self.heap[right], self.heap[smallest]) {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.heap.swap(pos, smallest);
            self.set_heap_index(self.heap[pos], pos);
            pos = smallest;
        }
        self.set_heap_index(self.heap[pos], pos);
    }

    /// Remove the task at heap position `pos`, restoring heap order.
    fn remove_at(&mut self, pos: usize) -> Task {
        let slot = self.heap.swap_remove(pos);
        let task = self.tasks[slot as usize]
            .take()
            .expect("heap references a live task");
        self.index.remove(&task.id);
        self.free.push(slot);

        if pos < self.heap.len() {
            self.set_heap_index(self.heap[pos], pos);
            self.sift_down(pos);
            self.sift_up(pos);
        }
        task
    }

    fn delete_task(&mut self, slot: u32) {
        let pos = self.task(slot).heap_index;
        debug_assert_eq!(self.heap[pos], slot);
        self.remove_at(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> CacheId {
        CacheId::from(s)
    }

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn schedule_requires_some_deadline() {
        let mut sched = ExpirationScheduler::new();
        let result = sched.schedule(id("a"), None, None, ts(0));
        assert!(matches!(result, Err(CacheError::InvalidArgument(_))));
        assert!(sched.is_empty());
    }

    #[test]
    fn zero_inactivity_counts_as_unset() {
        let mut sched = ExpirationScheduler::new();
        let result = sched.schedule(id("a"), None, Some(Duration::ZERO), ts(0));
        assert!(matches!(result, Err(CacheError::InvalidArgument(_))));
    }

    #[test]
    fn explicit_expiration_used_when_sooner() {
        let mut sched = ExpirationScheduler::new();
        sched
            .schedule(id("a"), Some(ts(3_000)), Some(Duration::from_secs(10)), ts(0))
            .unwrap();

        let expired = sched.sweep(ts(3_000));
        assert_eq!(expired.len(), 1);
        assert!(!expired[0].inactivity_timeout);
    }

    #[test]
    fn inactivity_window_used_when_sooner() {
        let mut sched = ExpirationScheduler::new();
        sched
            .schedule(id("a"), Some(ts(60_000)), Some(Duration::from_secs(5)), ts(0))
            .unwrap();

        let expired = sched.sweep(ts(5_000));
        assert_eq!(expired.len(), 1);
        assert!(expired[0].inactivity_timeout);
    }

    #[test]
    fn reschedule_replaces_pending_task() {
        let mut sched = ExpirationScheduler::new();
        sched.schedule(id("a"), Some(ts(1_000)), None, ts(0)).unwrap();
        sched.schedule(id("a"), Some(ts(9_000)), None, ts(0)).unwrap();

        assert_eq!(sched.len(), 1);
        assert!(sched.sweep(ts(1_000)).is_empty());
        assert_eq!(sched.sweep(ts(9_000)).len(), 1);
    }

    #[test]
    fn touch_resets_inactivity_window() {
        let mut sched = ExpirationScheduler::new();
        let window = Some(Duration::from_secs(5));

        sched.schedule(id("b"), None, window, ts(0)).unwrap();
        // Read at t=4s resets the window.
        sched.touch(id("b"), None, window, ts(4_000)).unwrap();

        assert!(sched.sweep(ts(8_000)).is_empty());

        let expired = sched.sweep(ts(10_000));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id("b"));
        assert!(expired[0].inactivity_timeout);
    }

    #[test]
    fn unschedule_deletes_pending_task() {
        let mut sched = ExpirationScheduler::new();
        sched.schedule(id("a"), Some(ts(1_000)), None, ts(0)).unwrap();

        assert!(sched.unschedule(&id("a")));
        assert!(!sched.unschedule(&id("a")));
        assert!(sched.sweep(ts(10_000)).is_empty());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sweep
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn sweep_returns_exactly_the_due_set() {
        let mut sched = ExpirationScheduler::new();
        for (name, at) in [("a", 1_000), ("b", 2_000), ("c", 3_000), ("d", 4_000)] {
            sched.schedule(id(name), Some(ts(at)), None, ts(0)).unwrap();
        }

        let expired = sched.sweep(ts(2_500));
        let names: Vec<_> = expired.iter().map(|e| e.id.as_str().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert_eq!(sched.len(), 2);
        assert!(sched.next_deadline().unwrap() > ts(2_500));
    }

    #[test]
    fn sweep_of_empty_heap_is_empty() {
        let mut sched = ExpirationScheduler::new();
        assert!(sched.sweep(ts(1)).is_empty());
    }

    #[test]
    fn ties_break_by_id_order() {
        let mut sched = ExpirationScheduler::new();
        for name in ["zeta", "alpha", "mid"] {
            sched.schedule(id(name), Some(ts(1_000)), None, ts(0)).unwrap();
        }

        let expired = sched.sweep(ts(1_000));
        let names: Vec<_> = expired.iter().map(|e| e.id.as_str().to_string()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn heap_order_survives_interleaved_deletes() {
        let mut sched = ExpirationScheduler::new();
        for i in 0..50u64 {
            sched
                .schedule(id(&format!("k{i:02}")), Some(ts(1_000 + i * 10)), None, ts(0))
                .unwrap();
        }
        // Delete every third task.
        for i in (0..50u64).step_by(3) {
            sched.unschedule(&id(&format!("k{i:02}")));
        }

        let expired = sched.sweep(ts(10_000));
        let mut sorted = expired.clone();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(expired, sorted, "sweep output must be in deadline order");
        assert!(sched.is_empty());
    }

    #[test]
    fn clear_drops_all_tasks_and_recycles_storage() {
        let mut sched = ExpirationScheduler::new();
        for i in 0..10u64 {
            sched
                .schedule(id(&format!("k{i}")), Some(ts(1_000 + i)), None, ts(0))
                .unwrap();
        }
        sched.clear();
        assert!(sched.is_empty());
        assert!(sched.sweep(ts(60_000)).is_empty());

        // Pool reuse after clear.
        sched.schedule(id("again"), Some(ts(5)), None, ts(0)).unwrap();
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn contains_tracks_index() {
        let mut sched = ExpirationScheduler::new();
        assert!(!sched.contains(&id("a")));
        sched.schedule(id("a"), Some(ts(10)), None, ts(0)).unwrap();
        assert!(sched.contains(&id("a")));
        sched.sweep(ts(10));
        assert!(!sched.contains(&id("a")));
    }
}
