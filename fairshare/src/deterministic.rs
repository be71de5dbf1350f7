//! A deterministic [Scheduler] over simulated time.
//!
//! The [Executor] keeps a clock (starting at the Unix epoch) and a min-heap of requested
//! wakeups. Time only moves when the caller asks it to, so runs are reproducible.
//!
//! # Example
//!
//! ```rust
//! use fairshare::{deterministic::Executor, Config, Controller, Scheduler};
//! use std::time::{Duration, SystemTime};
//!
//! let mut controller = Controller::new(Executor::default(), Config::default());
//! let a = controller.register_peer(1_000, 1_000);
//! let b = controller.register_peer(1_000, 1_000);
//! controller.send(a, b, (), 500).unwrap();
//!
//! let completions = controller.run();
//! assert_eq!(completions.len(), 1);
//! assert_eq!(
//!     controller.scheduler().now(),
//!     SystemTime::UNIX_EPOCH + Duration::from_millis(500)
//! );
//! ```

use crate::{Completion, Controller, Scheduler};
use std::{collections::BinaryHeap, time::SystemTime};
use tracing::trace;

/// Requested wakeup.
struct Alarm {
    time: SystemTime,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.time.eq(&other.time)
    }
}

impl Eq for Alarm {}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse the ordering for min-heap
        other.time.cmp(&self.time)
    }
}

/// Simulated clock with pending wakeups.
pub struct Executor {
    time: SystemTime,
    alarms: BinaryHeap<Alarm>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Executor {
    /// Creates an executor whose clock reads `start`.
    pub fn new(start: SystemTime) -> Self {
        Self {
            time: start,
            alarms: BinaryHeap::new(),
        }
    }

    /// Earliest pending wakeup.
    pub fn next_alarm(&self) -> Option<SystemTime> {
        self.alarms.peek().map(|alarm| alarm.time)
    }

    /// Number of pending wakeups.
    pub fn pending(&self) -> usize {
        self.alarms.len()
    }

    /// Pops the earliest wakeup at or before `until` and moves the clock to it.
    pub fn pop_due(&mut self, until: SystemTime) -> Option<SystemTime> {
        let next = self.alarms.peek()?;
        if next.time > until {
            return None;
        }
        let alarm = self.alarms.pop()?;
        self.time = self.time.max(alarm.time);
        trace!(now = ?self.time, "time advanced");
        Some(alarm.time)
    }

    /// Moves the clock forward to `to` (never backwards).
    ///
    /// # Panics
    ///
    /// Panics if a wakeup before `to` is still pending.
    pub fn advance(&mut self, to: SystemTime) {
        if let Some(next) = self.next_alarm() {
            assert!(next >= to, "skipping wakeup at {next:?}");
        }
        self.time = self.time.max(to);
    }
}

impl Scheduler for Executor {
    fn now(&self) -> SystemTime {
        self.time
    }

    fn schedule(&mut self, at: SystemTime) {
        assert!(at >= self.time, "wakeup at {at:?} requested in the past");
        self.alarms.push(Alarm { time: at });
    }
}

impl<M> Controller<Executor, M> {
    /// Delivers every wakeup due at or before `until`, then leaves the clock at `until`.
    pub fn run_until(&mut self, until: SystemTime) -> Vec<Completion<M>> {
        let mut completions = Vec::new();
        while self.scheduler_mut().pop_due(until).is_some() {
            completions.extend(self.on_wakeup());
        }
        self.scheduler_mut().advance(until);
        completions
    }

    /// Delivers wakeups until none are pending.
    ///
    /// Flows without capacity never request a wakeup, so this returns even if some stay stalled.
    pub fn run(&mut self) -> Vec<Completion<M>> {
        let mut completions = Vec::new();
        while let Some(next) = self.scheduler().next_alarm() {
            self.scheduler_mut().pop_due(next);
            completions.extend(self.on_wakeup());
        }
        completions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_alarms_fire_in_order() {
        let mut executor = Executor::default();
        executor.schedule(at(5));
        executor.schedule(at(2));
        executor.schedule(at(5));
        assert_eq!(executor.pending(), 3);
        assert_eq!(executor.next_alarm(), Some(at(2)));

        assert_eq!(executor.pop_due(at(4)), Some(at(2)));
        assert_eq!(executor.now(), at(2));
        assert_eq!(executor.pop_due(at(4)), None);
        executor.advance(at(4));
        assert_eq!(executor.now(), at(4));

        assert_eq!(executor.pop_due(at(5)), Some(at(5)));
        assert_eq!(executor.pop_due(at(5)), Some(at(5)));
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    #[should_panic(expected = "requested in the past")]
    fn test_past_wakeup_panics() {
        let mut executor = Executor::new(at(10));
        executor.schedule(at(9));
    }

    #[test]
    #[should_panic(expected = "skipping wakeup")]
    fn test_advance_cannot_skip_alarms() {
        let mut executor = Executor::default();
        executor.schedule(at(1));
        executor.advance(at(2));
    }
}
