// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cooperative task queue with delayed tasks.
//!
//! Nothing runs by itself: the owner polls [`MessageLoop::pop_ready`] and
//! dispatches. Time comes from the injected [`Clock`], so tests drive the
//! loop by advancing a fake clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dlc::Clock;

/// Handle for a posted task. Cancelling a task that already ran is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

pub struct MessageLoop<T> {
    clock: Arc<dyn Clock>,
    next_id: u64,
    queue: BTreeMap<(Duration, TaskId), T>,
    deadlines: HashMap<TaskId, Duration>,
}

impl<T> MessageLoop<T> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, next_id: 1, queue: BTreeMap::new(), deadlines: HashMap::new() }
    }

    pub fn post(&mut self, task: T) -> TaskId {
        self.post_delayed(task, Duration::ZERO)
    }

    /// Queues `task` to become ready `delay` from now. Tasks with equal
    /// deadlines run in posting order.
    pub fn post_delayed(&mut self, task: T, delay: Duration) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let deadline = self.clock.now().saturating_add(delay);
        self.queue.insert((deadline, id), task);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Returns true if the task was still pending.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.queue.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    pub fn is_pending(&self, id: TaskId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Removes and returns the earliest task whose deadline has passed.
    pub fn pop_ready(&mut self) -> Option<(TaskId, T)> {
        let now = self.clock.now();
        let key = *self.queue.keys().next()?;
        if key.0 > now {
            return None;
        }
        let task = self.queue.remove(&key)?;
        self.deadlines.remove(&key.1);
        Some((key.1, task))
    }

    /// Time until the next task is ready; zero when one is overdue.
    pub fn next_deadline(&self) -> Option<Duration> {
        let (deadline, _) = self.queue.keys().next()?;
        Some(deadline.saturating_sub(self.clock.now()))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.deadlines.clear();
    }
}
