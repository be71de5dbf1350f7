//! Incremental max-min fair bandwidth sharing for discrete-event network simulation.
//!
//! Every simulated host ([Peer]) has a fixed upload and download capacity. Bulk transfers
//! between hosts ([Flow]) share that capacity max-min fairly: no flow can be sped up without
//! slowing down a flow that is already as slow or slower on a saturated link. The [Controller]
//! keeps this allocation current as transfers start, finish, and hosts disconnect, and asks a
//! [Scheduler] to wake it when the next transfer completes.
//!
//! # Incremental reallocation
//!
//! Recomputing every rate on every change does not scale to large overlays. When a flow appears
//! or leaves, the controller instead discovers the flows whose fair share may change (walking
//! outwards from the flow's endpoints through saturated links), reallocates only those, and then
//! certifies the result: every flow touching a peer whose state changed must still be limited by
//! a saturated endpoint where it is the fastest flow. Flows failing the check widen the
//! reallocated set until the allocation certifies, so incremental results always equal a full
//! recomputation ([Config::full]).
//!
//! # Arithmetic
//!
//! Rates, free capacities, and remaining bytes are exact rationals, so saturation and ties are
//! decided exactly. Projected completion times are rounded up to the next nanosecond.
//!
//! # Example
//!
//! ```rust
//! use fairshare::{deterministic::Executor, Config, Controller};
//! use std::time::{Duration, SystemTime};
//!
//! let mut controller = Controller::new(Executor::default(), Config::default());
//! let a = controller.register_peer(10, 10);
//! let b = controller.register_peer(10, 100);
//! let c = controller.register_peer(10, 100);
//!
//! // Both transfers share a's upload.
//! controller.send(a, b, "hello", 100).unwrap();
//! controller.send(a, c, "world", 100).unwrap();
//!
//! let completions = controller.run_until(SystemTime::UNIX_EPOCH + Duration::from_secs(60));
//! assert_eq!(completions.len(), 2);
//! for completion in completions {
//!     assert_eq!(
//!         completion.deliver_at,
//!         Some(SystemTime::UNIX_EPOCH + Duration::from_secs(20))
//!     );
//! }
//! ```

use num_rational::BigRational;
use std::time::Duration;
use thiserror::Error;

mod controller;
pub mod deterministic;
mod flow;
pub mod graph;
mod metrics;
mod peer;
mod schedule;

pub use controller::{Completion, Config, Controller, Scheduler, Stats, MAX_LATENCY};
pub use flow::{duration, transfer, Flow, FlowId};
pub use graph::{Event, FlowGraph, Subgraph};
pub use peer::{Direction, Peer, PeerId};
pub use schedule::Schedule;

/// Errors returned by [FlowGraph] and [Controller].
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("unknown flow: {0}")]
    UnknownFlow(FlowId),
    #[error("peer has active flows: {0}")]
    PeerHasActiveFlows(PeerId),
    #[error("invalid rate (must be non-negative): {0}")]
    InvalidRate(BigRational),
    #[error("invalid latency (exceeds maximum): {0:?}")]
    InvalidLatency(Duration),
    #[error("not valid to send to self: {0}")]
    SelfTransfer(PeerId),
    #[error("peer offline: {0}")]
    PeerOffline(PeerId),
    #[error("flow already exists: {0}")]
    FlowExists(FlowId),
}
