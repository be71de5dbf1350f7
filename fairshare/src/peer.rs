//! Simulated hosts and their upload/download capacity.

use fairshare_utils::BigRationalExt;
use num_rational::BigRational;
use num_traits::Zero;
use std::fmt;

/// Handle of a peer in a [crate::FlowGraph].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u32);

impl PeerId {
    pub(crate) const fn new(id: u32) -> Self {
        Self(id)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the raw handle value.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Side of a peer's access link a flow consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// Capacity used by flows the peer sends.
    Up,
    /// Capacity used by flows the peer receives.
    Down,
}

impl Direction {
    /// Returns the other side.
    pub const fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }
}

/// Capacity state of a simulated host (bytes per second).
#[derive(Clone, Debug)]
pub struct Peer {
    max_up: u64,
    max_down: u64,
    free_up: BigRational,
    free_down: BigRational,
    online: bool,
}

impl Peer {
    /// Creates an online peer with all capacity free.
    pub fn new(max_up: u64, max_down: u64) -> Self {
        Self {
            max_up,
            max_down,
            free_up: BigRational::from_u64(max_up),
            free_down: BigRational::from_u64(max_down),
            online: true,
        }
    }

    /// Maximum capacity in `direction`.
    pub const fn max(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Up => self.max_up,
            Direction::Down => self.max_down,
        }
    }

    /// Capacity in `direction` not assigned to any flow.
    pub const fn free(&self, direction: Direction) -> &BigRational {
        match direction {
            Direction::Up => &self.free_up,
            Direction::Down => &self.free_down,
        }
    }

    /// Returns `true` if no capacity is left in `direction`.
    pub fn is_saturated(&self, direction: Direction) -> bool {
        self.free(direction).is_zero()
    }

    /// Returns `true` if the peer accepts new transfers.
    pub const fn is_online(&self) -> bool {
        self.online
    }

    pub(crate) fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    /// Charges `delta` (possibly negative) against the free capacity in `direction`.
    ///
    /// # Panics
    ///
    /// Panics if the free capacity would leave `[0, max]`.
    pub(crate) fn charge(&mut self, direction: Direction, delta: &BigRational) {
        let max = BigRational::from_u64(self.max(direction));
        let free = match direction {
            Direction::Up => &mut self.free_up,
            Direction::Down => &mut self.free_down,
        };
        *free -= delta;
        assert!(
            *free >= BigRational::zero() && *free <= max,
            "free {direction:?} capacity {free} outside [0, {max}]"
        );
    }
}
