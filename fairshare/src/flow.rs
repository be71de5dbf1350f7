//! Bulk transfers between two peers and the time math that projects their completion.
//!
//! Progress is tracked with exact rationals: the caller advances a flow to the current time
//! before changing its rate, so fractional bytes sent between discrete ticks are never lost.

use crate::PeerId;
use fairshare_utils::{time::NANOS_PER_SEC, BigRationalExt, DurationExt, SystemTimeExt};
use num_rational::BigRational;
use num_traits::Zero;
use std::{
    fmt,
    time::{Duration, SystemTime},
};

/// Handle of a flow in a [crate::FlowGraph].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowId(u64);

impl FlowId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw handle value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow-{}", self.0)
    }
}

/// One ongoing transfer from `src` to `dst`.
#[derive(Clone, Debug)]
pub struct Flow {
    src: PeerId,
    dst: PeerId,
    rate: BigRational,
    remaining: BigRational,
    latency: Duration,
    created_at: SystemTime,
    last_update: SystemTime,
    deadline: Option<SystemTime>,
}

impl Flow {
    /// Creates an idle flow (rate zero) carrying `size` bytes.
    pub fn new(src: PeerId, dst: PeerId, size: u64, latency: Duration, now: SystemTime) -> Self {
        let mut flow = Self {
            src,
            dst,
            rate: BigRational::zero(),
            remaining: BigRational::from_u64(size),
            latency,
            created_at: now,
            last_update: now,
            deadline: None,
        };
        flow.refresh(now);
        flow
    }

    /// Peer uploading the bytes.
    pub const fn src(&self) -> PeerId {
        self.src
    }

    /// Peer downloading the bytes.
    pub const fn dst(&self) -> PeerId {
        self.dst
    }

    /// Allocated rate in bytes per second.
    pub const fn rate(&self) -> &BigRational {
        &self.rate
    }

    /// Bytes left as of the last update.
    pub const fn remaining(&self) -> &BigRational {
        &self.remaining
    }

    /// Propagation delay added once the last byte has been sent.
    pub const fn latency(&self) -> Duration {
        self.latency
    }

    /// Time the current message started transferring.
    pub const fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Projected time the last byte is sent, `None` if the flow is stalled.
    pub const fn deadline(&self) -> Option<SystemTime> {
        self.deadline
    }

    /// Accounts for bytes sent at the current rate since the last update.
    pub(crate) fn advance(&mut self, now: SystemTime) {
        let elapsed = now.saturating_since(self.last_update);
        if !elapsed.is_zero() {
            self.remaining = transfer(&self.rate, elapsed, self.remaining.clone());
        }
        self.last_update = self.last_update.max(now);
    }

    /// Switches to `rate`, charging the old rate for the time already elapsed.
    pub(crate) fn set_rate(&mut self, now: SystemTime, rate: BigRational) {
        self.advance(now);
        self.rate = rate;
        self.refresh(now);
    }

    /// Starts carrying the next queued message on the same flow.
    pub(crate) fn burst(&mut self, now: SystemTime, size: u64) {
        self.advance(now);
        self.created_at = now;
        self.remaining = BigRational::from_u64(size);
        self.refresh(now);
    }

    fn refresh(&mut self, now: SystemTime) {
        // Transfers whose arrival cannot be represented never complete
        let latency = self.latency;
        self.deadline = duration(&self.rate, &self.remaining)
            .and_then(|d| now.checked_add(d))
            .filter(|at| at.checked_add(latency).is_some());
    }
}

/// Calculate the time it will take to send `remaining` bytes at `rate`.
///
/// The computation rounds up so callers receive the minimum duration that guarantees at least the
/// requested amount of work was transmitted. Returns `None` if the transfer never completes.
pub fn duration(rate: &BigRational, remaining: &BigRational) -> Option<Duration> {
    if remaining.is_zero() {
        return Some(Duration::ZERO);
    }

    // If the rate is zero, the transfer will never complete.
    if rate.is_zero() {
        return None;
    }

    let seconds = remaining / rate;
    let nanos = seconds * BigRational::from_u128(NANOS_PER_SEC);
    let ns = nanos.ceil_to_u128()?;
    Some(Duration::from_nanos_saturating(ns))
}

/// Calculate the remaining work after transferring data for `elapsed` at `rate`.
///
/// Feed the returned ratio back into subsequent calls to preserve fractional progress across
/// discrete scheduling ticks.
pub fn transfer(rate: &BigRational, elapsed: Duration, mut remaining: BigRational) -> BigRational {
    if remaining.is_zero() || rate.is_zero() || elapsed.is_zero() {
        return remaining;
    }

    let elapsed = BigRational::from_frac_u128(elapsed.as_nanos(), NANOS_PER_SEC);
    let usage = rate * &elapsed;
    if usage >= remaining {
        return BigRational::zero();
    }

    remaining -= usage;
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> (PeerId, PeerId) {
        (PeerId::new(0), PeerId::new(1))
    }

    #[test]
    fn test_fractional_progress_carries_across_updates() {
        let (src, dst) = peers();
        let start = SystemTime::UNIX_EPOCH;
        let mut flow = Flow::new(src, dst, 10, Duration::ZERO, start);
        flow.set_rate(start, BigRational::from_frac_u64(1, 2));
        assert_eq!(flow.deadline(), Some(start + Duration::from_secs(20)));

        flow.advance(start + Duration::from_millis(500));
        assert_eq!(flow.remaining(), &BigRational::from_frac_u64(39, 4));
        flow.advance(start + Duration::from_secs(2));
        assert_eq!(flow.remaining(), &BigRational::from_u64(9));

        // Advancing alone never moves the deadline.
        assert_eq!(flow.deadline(), Some(start + Duration::from_secs(20)));

        // Going back in time is ignored.
        flow.advance(start + Duration::from_secs(1));
        assert_eq!(flow.remaining(), &BigRational::from_u64(9));
    }

    #[test]
    fn test_slowdown_after_partial_progress() {
        let (src, dst) = peers();
        let start = SystemTime::UNIX_EPOCH;
        let mut flow = Flow::new(src, dst, 1, Duration::ZERO, start);
        flow.set_rate(start, BigRational::from_frac_u64(1, 2));
        assert_eq!(flow.deadline(), Some(start + Duration::from_secs(2)));

        // 3/4 of a byte is left after half a second, which takes 3s at a quarter byte per second.
        let slowdown = start + Duration::from_millis(500);
        flow.set_rate(slowdown, BigRational::from_frac_u64(1, 4));
        assert_eq!(flow.remaining(), &BigRational::from_frac_u64(3, 4));
        assert_eq!(flow.deadline(), Some(slowdown + Duration::from_secs(3)));
    }

    #[test]
    fn test_unrepresentable_arrival_stalls() {
        let (src, dst) = peers();
        let start = SystemTime::UNIX_EPOCH;
        let mut flow = Flow::new(src, dst, 100, Duration::MAX, start);
        flow.set_rate(start, BigRational::from_u64(10));
        assert_eq!(flow.deadline(), None);
    }

    #[test]
    fn test_duration_rounds_up_to_nanosecond() {
        let rate = BigRational::from_u64(3);
        let time = duration(&rate, &BigRational::from_u64(1)).expect("finite time");
        assert_eq!(time, Duration::from_nanos(333_333_334));
    }

    #[test]
    fn test_stalled_flow_never_completes() {
        let (src, dst) = peers();
        let flow = Flow::new(src, dst, 100, Duration::ZERO, SystemTime::UNIX_EPOCH);
        assert!(flow.rate().is_zero());
        assert_eq!(flow.deadline(), None);
    }

    #[test]
    fn test_empty_message_completes_immediately() {
        let (src, dst) = peers();
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(4);
        let flow = Flow::new(src, dst, 0, Duration::ZERO, now);
        assert_eq!(flow.deadline(), Some(now));
    }

    #[test]
    fn test_rate_change_preserves_progress() {
        let (src, dst) = peers();
        let start = SystemTime::UNIX_EPOCH;
        let mut flow = Flow::new(src, dst, 100, Duration::ZERO, start);

        flow.set_rate(start, BigRational::from_u64(10));
        assert_eq!(flow.deadline(), Some(start + Duration::from_secs(10)));

        // Half the bytes are gone after five seconds; doubling the rate halves what is left.
        let midway = start + Duration::from_secs(5);
        flow.set_rate(midway, BigRational::from_u64(20));
        assert_eq!(flow.remaining(), &BigRational::from_u64(50));
        assert_eq!(
            flow.deadline(),
            Some(midway + Duration::from_millis(2_500))
        );

        flow.advance(midway + Duration::from_millis(2_500));
        assert!(flow.remaining().is_zero());
    }

    #[test]
    fn test_burst_resets_remaining_and_keeps_rate() {
        let (src, dst) = peers();
        let start = SystemTime::UNIX_EPOCH;
        let mut flow = Flow::new(src, dst, 10, Duration::ZERO, start);
        flow.set_rate(start, BigRational::from_u64(10));

        let done = start + Duration::from_secs(1);
        flow.burst(done, 30);
        assert_eq!(flow.rate(), &BigRational::from_u64(10));
        assert_eq!(flow.created_at(), done);
        assert_eq!(flow.deadline(), Some(done + Duration::from_secs(3)));
    }

    #[test]
    fn test_deadline_never_precedes_now() {
        let (src, dst) = peers();
        let start = SystemTime::UNIX_EPOCH;
        let mut flow = Flow::new(src, dst, 1, Duration::ZERO, start);
        flow.set_rate(start, BigRational::from_u64(1_000_000));

        let later = start + Duration::from_secs(1);
        flow.set_rate(later, BigRational::from_u64(1));
        assert!(flow.remaining().is_zero());
        assert_eq!(flow.deadline(), Some(later));
    }
}
