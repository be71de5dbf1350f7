//! Leverage common functionality across fairshare crates.

pub mod priority_queue;
pub use priority_queue::PriorityQueue;
pub mod rational;
pub use rational::BigRationalExt;
pub mod time;
pub use time::{DurationExt, SystemTimeExt};
