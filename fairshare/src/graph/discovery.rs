//! Discovery of the flows whose fair rate may change when one flow appears or leaves.
//!
//! The traversal alternates between the peers reached from the source of the triggering flow and
//! those reached from its destination. A peer is visited in one of four [Role]s describing how its
//! load changed on one side; visiting includes the flows on that side the change can reach and
//! queues the far endpoint of each included flow in the mirrored role.

use super::FlowGraph;
use crate::{Direction, Flow, FlowId, PeerId};
use fairshare_utils::BigRationalExt;
use num_rational::BigRational;
use std::collections::BTreeSet;
use tracing::trace;

/// Change that triggers discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The flow was created and is about to be linked.
    New,
    /// The flow was unlinked but its capacity is still charged to its endpoints.
    Finished,
}

/// How the load on one side of a visited peer changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Role {
    UpIncrease,
    UpDecrease,
    DownIncrease,
    DownDecrease,
}

impl Role {
    /// Role applied by the source-side frontier at `hop`.
    const fn source(event: Event, hop: usize) -> Self {
        match (event, hop % 2 == 0) {
            (Event::New, true) => Self::UpIncrease,
            (Event::New, false) => Self::DownDecrease,
            (Event::Finished, true) => Self::UpDecrease,
            (Event::Finished, false) => Self::DownIncrease,
        }
    }

    /// Role applied by the destination-side frontier at `hop`.
    const fn destination(event: Event, hop: usize) -> Self {
        match (event, hop % 2 == 0) {
            (Event::New, true) => Self::DownIncrease,
            (Event::New, false) => Self::UpDecrease,
            (Event::Finished, true) => Self::DownDecrease,
            (Event::Finished, false) => Self::UpIncrease,
        }
    }

    /// Role of the far endpoint of a flow included while visiting in this role.
    ///
    /// More load on one side of a flow slows it down, which frees capacity on the opposite side
    /// of its other endpoint (and vice versa).
    const fn far(self) -> Self {
        match self {
            Self::UpIncrease => Self::DownDecrease,
            Self::UpDecrease => Self::DownIncrease,
            Self::DownIncrease => Self::UpDecrease,
            Self::DownDecrease => Self::UpIncrease,
        }
    }

    const fn direction(self) -> Direction {
        match self {
            Self::UpIncrease | Self::UpDecrease => Direction::Up,
            Self::DownIncrease | Self::DownDecrease => Direction::Down,
        }
    }

    const fn is_increase(self) -> bool {
        matches!(self, Self::UpIncrease | Self::DownIncrease)
    }
}

/// Flows selected for reallocation, by handle, plus every peer they touch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subgraph {
    flows: BTreeSet<FlowId>,
    peers: BTreeSet<PeerId>,
}

impl Subgraph {
    /// Creates an empty subgraph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a flow (idempotent) and its endpoints.
    pub fn insert(&mut self, id: FlowId, flow: &Flow) -> bool {
        self.touch(flow.src());
        self.touch(flow.dst());
        self.flows.insert(id)
    }

    /// Records a peer whose state changed without adding any of its flows.
    pub fn touch(&mut self, peer: PeerId) {
        self.peers.insert(peer);
    }

    /// Merges another subgraph into this one.
    pub fn extend(&mut self, other: Subgraph) {
        self.flows.extend(other.flows);
        self.peers.extend(other.peers);
    }

    /// Flows to reallocate.
    pub const fn flows(&self) -> &BTreeSet<FlowId> {
        &self.flows
    }

    /// Peers whose flows must be certified after reallocation.
    pub const fn peers(&self) -> &BTreeSet<PeerId> {
        &self.peers
    }

    /// Returns `true` if the flow is part of the subgraph.
    pub fn contains(&self, id: FlowId) -> bool {
        self.flows.contains(&id)
    }

    /// Number of flows.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Returns `true` if no flow was selected.
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

impl FlowGraph {
    /// Subgraph covering every live flow.
    pub fn all(&self) -> Subgraph {
        let mut subgraph = Subgraph::new();
        for (id, flow) in self.flows() {
            subgraph.insert(id, flow);
        }
        subgraph
    }

    /// Collects the flows whose fair rate may change because `flow` appeared or left.
    ///
    /// For [Event::New] the flow must not be linked yet and is included in the result. For
    /// [Event::Finished] it must already be detached while its rate is still charged, so the
    /// traversal observes the saturation state the flow contributed to.
    pub fn discover(&self, id: FlowId, flow: &Flow, event: Event) -> Subgraph {
        assert!(
            self.flow(id).is_none(),
            "{id} must not be linked while discovering its impact"
        );
        let mut subgraph = Subgraph::new();
        subgraph.touch(flow.src());
        subgraph.touch(flow.dst());
        if event == Event::New {
            subgraph.insert(id, flow);
        }

        let mut visited = BTreeSet::new();
        let mut sources = vec![flow.src()];
        let mut destinations = vec![flow.dst()];
        visited.insert((flow.src(), Role::source(event, 0)));
        visited.insert((flow.dst(), Role::destination(event, 0)));

        let mut hop = 0;
        while !sources.is_empty() || !destinations.is_empty() {
            let mut next_sources = Vec::new();
            for peer in sources {
                let role = Role::source(event, hop);
                self.visit(peer, role, &mut visited, &mut subgraph, &mut next_sources);
            }
            let mut next_destinations = Vec::new();
            for peer in destinations {
                let role = Role::destination(event, hop);
                self.visit(peer, role, &mut visited, &mut subgraph, &mut next_destinations);
            }
            sources = next_sources;
            destinations = next_destinations;
            hop += 1;
        }
        trace!(%id, ?event, hops = hop, flows = subgraph.len(), "discovered subgraph");
        subgraph
    }

    fn visit(
        &self,
        peer: PeerId,
        role: Role,
        visited: &mut BTreeSet<(PeerId, Role)>,
        subgraph: &mut Subgraph,
        frontier: &mut Vec<PeerId>,
    ) {
        let direction = role.direction();
        let saturated = self.is_saturated(peer, direction);
        for id in self.links(peer, direction) {
            let flow = self.expect_flow(id);
            let included = saturated
                || (role.is_increase()
                    && self.is_remotely_bottlenecked(flow, peer)
                    && self.may_flip(peer, direction, flow));
            if !included {
                continue;
            }
            subgraph.insert(id, flow);

            let far = match direction {
                Direction::Up => flow.dst(),
                Direction::Down => flow.src(),
            };
            if visited.insert((far, role.far())) {
                frontier.push(far);
            }
        }
    }

    /// Returns `true` if one more flow at `peer` could cut `flow` below its current rate.
    ///
    /// Water-fills the maximum capacity of `peer` in `direction` over the flows there plus one
    /// newcomer, walking them by ascending rate. The first flow whose rate reaches the level at
    /// its position is where the newcomer would start taking capacity away; if that happens at
    /// or below the rate of `flow`, its remote bottleneck may turn into a local one.
    pub fn may_flip(&self, peer: PeerId, direction: Direction, flow: &Flow) -> bool {
        let Some(max) = self.peer(peer).map(|peer| peer.max(direction)) else {
            return false;
        };
        let mut rates: Vec<&BigRational> = self
            .links(peer, direction)
            .map(|id| self.expect_flow(id).rate())
            .collect();
        rates.sort();

        let shares = rates.len() + 1;
        let mut left = BigRational::from_u64(max);
        for (position, rate) in rates.into_iter().enumerate() {
            let level = &left / BigRational::from_usize(shares - position);
            if rate >= &level {
                return true;
            }
            if rate >= flow.rate() {
                return false;
            }
            left -= rate;
        }
        false
    }
}
