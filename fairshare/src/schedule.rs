//! Index of live flows ordered by projected completion time.

use crate::FlowId;
use fairshare_utils::PriorityQueue;
use std::time::SystemTime;

/// Flows with a finite deadline, earliest first (ties broken by [FlowId]).
#[derive(Default)]
pub struct Schedule {
    queue: PriorityQueue<FlowId, SystemTime>,
}

impl Schedule {
    /// Creates an empty schedule.
    pub const fn new() -> Self {
        Self {
            queue: PriorityQueue::new(),
        }
    }

    /// Earliest deadline, `None` if no flow is making progress.
    pub fn next_arrival(&self) -> Option<SystemTime> {
        self.queue.peek().map(|(_, deadline)| *deadline)
    }

    /// Returns `true` if some flow is due at `now`.
    pub fn has_arrival(&self, now: SystemTime) -> bool {
        self.next_arrival() == Some(now)
    }

    /// Removes and returns one flow due at `now`.
    ///
    /// # Panics
    ///
    /// Panics if the earliest deadline is already in the past: the caller missed a wakeup.
    pub fn take_arrival(&mut self, now: SystemTime) -> Option<FlowId> {
        let (_, deadline) = self.queue.peek()?;
        assert!(
            *deadline >= now,
            "deadline {deadline:?} passed without completing (now {now:?})"
        );
        if *deadline != now {
            return None;
        }
        self.queue.pop().map(|(id, _)| id)
    }

    /// Records the current deadline of a flow; `None` drops it from the schedule.
    pub fn reindex(&mut self, id: FlowId, deadline: Option<SystemTime>) {
        match deadline {
            Some(deadline) => self.queue.put(id, deadline),
            None => {
                self.queue.remove(&id);
            }
        }
    }

    /// Forgets a flow that is no longer live.
    pub fn remove(&mut self, id: FlowId) -> Option<SystemTime> {
        self.queue.remove(&id)
    }

    /// Deadline recorded for a flow.
    pub fn deadline(&self, id: FlowId) -> Option<SystemTime> {
        self.queue.get(&id).copied()
    }

    /// Number of scheduled flows.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if no flow is scheduled.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
