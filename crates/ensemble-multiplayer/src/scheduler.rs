//! Deadline-keyed task queue processed once per tick.
//!
//! Delayed actions (deauthorizing a projectile id after its grace period,
//! giving up on a scene restore) are scheduled here instead of on timers or
//! threads. Each tick the owner drains every task whose deadline has passed.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Handle returned by [`TaskQueue::schedule`], used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// A cancellable set of tasks ordered by deadline.
///
/// Tasks sharing a deadline are returned in scheduling order.
#[derive(Debug)]
pub struct TaskQueue<T> {
    next_seq: u64,
    tasks: BTreeMap<(Instant, u64), T>,
    deadlines: HashMap<u64, Instant>,
}

impl<T> TaskQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            tasks: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Schedule `task` to become due at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, task: T) -> TaskHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.insert((deadline, seq), task);
        self.deadlines.insert(seq, deadline);
        TaskHandle(seq)
    }

    /// Cancel a pending task, returning it if it had not yet run.
    pub fn cancel(&mut self, handle: TaskHandle) -> Option<T> {
        let deadline = self.deadlines.remove(&handle.0)?;
        self.tasks.remove(&(deadline, handle.0))
    }

    /// Remove and return every task with `deadline <= now`, earliest first.
    pub fn drain_due(&mut self, now: Instant) -> Vec<T> {
        let later = self.tasks.split_off(&(now, u64::MAX));
        let due = std::mem::replace(&mut self.tasks, later);
        due.into_iter()
            .map(|((_, seq), task)| {
                self.deadlines.remove(&seq);
                task
            })
            .collect()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drop every pending task.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.deadlines.clear();
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
