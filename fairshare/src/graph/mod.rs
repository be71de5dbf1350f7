//! Bipartite index over peers and the flows between them.
//!
//! Peers live in an arena addressed by [PeerId]; each slot keeps the ordered set of flows it
//! uploads and downloads so "flows uploading from X" and "flows downloading to X" never require a
//! scan. Flows live in an ordered map addressed by [FlowId]. Every algorithm that walks the graph
//! ([allocation], [discovery]) refers to these records by handle and never clones them.

use crate::{Direction, Error, Flow, FlowId, Peer, PeerId};
use num_rational::BigRational;
use num_traits::{Signed, Zero};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, SystemTime},
};

pub mod allocation;
pub mod discovery;

pub use discovery::{Event, Subgraph};

/// Arena slot of a registered peer.
#[derive(Debug)]
struct Node {
    peer: Peer,
    uploads: BTreeSet<FlowId>,
    downloads: BTreeSet<FlowId>,
}

impl Node {
    fn new(peer: Peer) -> Self {
        Self {
            peer,
            uploads: BTreeSet::new(),
            downloads: BTreeSet::new(),
        }
    }

    const fn links(&self, direction: Direction) -> &BTreeSet<FlowId> {
        match direction {
            Direction::Up => &self.uploads,
            Direction::Down => &self.downloads,
        }
    }
}

/// Live peers and flows of one simulation.
#[derive(Debug, Default)]
pub struct FlowGraph {
    nodes: Vec<Option<Node>>,
    flows: BTreeMap<FlowId, Flow>,
    pairs: BTreeMap<(PeerId, PeerId), FlowId>,
    next_flow: u64,
}

impl FlowGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer with the given capacities (bytes per second).
    pub fn add_peer(&mut self, max_up: u64, max_down: u64) -> PeerId {
        let id = PeerId::new(
            u32::try_from(self.nodes.len()).expect("peer handles exhausted"),
        );
        self.nodes.push(Some(Node::new(Peer::new(max_up, max_down))));
        id
    }

    /// Removes a peer that no longer takes part in any flow.
    pub fn remove_peer(&mut self, id: PeerId) -> Result<Peer, Error> {
        let node = self.node(id).ok_or(Error::UnknownPeer(id))?;
        if !node.uploads.is_empty() || !node.downloads.is_empty() {
            return Err(Error::PeerHasActiveFlows(id));
        }
        let node = self.nodes[id.index()]
            .take()
            .ok_or(Error::UnknownPeer(id))?;
        Ok(node.peer)
    }

    /// Returns the peer registered under `id`.
    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.node(id).map(|node| &node.peer)
    }

    pub(crate) fn peer_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.node_mut(id).map(|node| &mut node.peer)
    }

    /// Iterates over all registered peers in handle order.
    pub fn peers(&self) -> impl Iterator<Item = (PeerId, &Peer)> + '_ {
        self.nodes.iter().enumerate().filter_map(|(idx, node)| {
            node.as_ref()
                .map(|node| (PeerId::new(idx as u32), &node.peer))
        })
    }

    /// Returns the flow registered under `id`.
    pub fn flow(&self, id: FlowId) -> Option<&Flow> {
        self.flows.get(&id)
    }

    /// Iterates over all live flows in handle order.
    pub fn flows(&self) -> impl Iterator<Item = (FlowId, &Flow)> + '_ {
        self.flows.iter().map(|(id, flow)| (*id, flow))
    }

    /// Number of live flows.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Returns `true` if no flow is live.
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Returns the flow currently carrying bytes from `src` to `dst`.
    pub fn flow_between(&self, src: PeerId, dst: PeerId) -> Option<FlowId> {
        self.pairs.get(&(src, dst)).copied()
    }

    /// Flows `peer` takes part in on the given side (empty for unknown peers).
    pub fn links(&self, peer: PeerId, direction: Direction) -> impl Iterator<Item = FlowId> + '_ {
        self.node(peer)
            .into_iter()
            .flat_map(move |node| node.links(direction).iter().copied())
    }

    /// Flows uploading from `peer`.
    pub fn uploads(&self, peer: PeerId) -> impl Iterator<Item = FlowId> + '_ {
        self.links(peer, Direction::Up)
    }

    /// Flows downloading to `peer`.
    pub fn downloads(&self, peer: PeerId) -> impl Iterator<Item = FlowId> + '_ {
        self.links(peer, Direction::Down)
    }

    /// Number of flows `peer` takes part in on the given side.
    pub fn degree(&self, peer: PeerId, direction: Direction) -> usize {
        self.node(peer)
            .map_or(0, |node| node.links(direction).len())
    }

    /// Creates a stalled flow from `src` to `dst` without linking it into the graph.
    ///
    /// The flow only becomes visible once passed to [FlowGraph::insert], which lets callers
    /// inspect the graph as it was before the flow appeared.
    pub fn prepare(
        &mut self,
        src: PeerId,
        dst: PeerId,
        size: u64,
        latency: Duration,
        now: SystemTime,
    ) -> Result<(FlowId, Flow), Error> {
        if src == dst {
            return Err(Error::SelfTransfer(src));
        }
        for peer in [src, dst] {
            let peer_ref = self.peer(peer).ok_or(Error::UnknownPeer(peer))?;
            if !peer_ref.is_online() {
                return Err(Error::PeerOffline(peer));
            }
        }
        if let Some(existing) = self.flow_between(src, dst) {
            return Err(Error::FlowExists(existing));
        }

        let id = FlowId::new(self.next_flow);
        self.next_flow += 1;
        Ok((id, Flow::new(src, dst, size, latency, now)))
    }

    /// Links a flow into both endpoint indices.
    ///
    /// # Panics
    ///
    /// Panics if the handle is reused, an endpoint is unknown, or the pair already has a flow.
    pub fn insert(&mut self, id: FlowId, flow: Flow) {
        let (src, dst) = (flow.src(), flow.dst());
        assert!(
            self.pairs.insert((src, dst), id).is_none(),
            "{src} -> {dst} already has a flow"
        );
        self.expect_node_mut(src).uploads.insert(id);
        self.expect_node_mut(dst).downloads.insert(id);
        let rate = flow.rate().clone();
        assert!(self.flows.insert(id, flow).is_none(), "{id} inserted twice");
        if !rate.is_zero() {
            self.expect_node_mut(src).peer.charge(Direction::Up, &rate);
            self.expect_node_mut(dst).peer.charge(Direction::Down, &rate);
        }
    }

    /// Unlinks a flow from the graph while its rate stays charged to both endpoints.
    ///
    /// Discovery for a finished flow must observe the capacity state from before the flow left,
    /// so releasing the capacity is a separate step ([FlowGraph::release]).
    pub fn detach(&mut self, id: FlowId) -> Result<Flow, Error> {
        let flow = self.flows.remove(&id).ok_or(Error::UnknownFlow(id))?;
        let (src, dst) = (flow.src(), flow.dst());
        self.pairs.remove(&(src, dst));
        assert!(
            self.expect_node_mut(src).uploads.remove(&id),
            "{id} missing from uploads of {src}"
        );
        assert!(
            self.expect_node_mut(dst).downloads.remove(&id),
            "{id} missing from downloads of {dst}"
        );
        Ok(flow)
    }

    /// Returns the capacity a detached flow still holds to its endpoints.
    pub fn release(&mut self, flow: &Flow) {
        if flow.rate().is_zero() {
            return;
        }
        let give_back = -flow.rate().clone();
        if let Some(src) = self.peer_mut(flow.src()) {
            src.charge(Direction::Up, &give_back);
        }
        if let Some(dst) = self.peer_mut(flow.dst()) {
            dst.charge(Direction::Down, &give_back);
        }
    }

    /// Detaches a flow and releases its capacity.
    pub fn remove(&mut self, id: FlowId) -> Result<Flow, Error> {
        let flow = self.detach(id)?;
        self.release(&flow);
        Ok(flow)
    }

    /// Sets the rate of a flow, keeping both endpoints' free capacity consistent.
    ///
    /// Bytes sent at the old rate up to `now` are accounted for first.
    pub fn set_rate(&mut self, id: FlowId, now: SystemTime, rate: BigRational) -> Result<(), Error> {
        if rate.is_negative() {
            return Err(Error::InvalidRate(rate));
        }
        let flow = self.flows.get_mut(&id).ok_or(Error::UnknownFlow(id))?;
        if flow.rate() == &rate {
            return Ok(());
        }
        let delta = &rate - flow.rate();
        let (src, dst) = (flow.src(), flow.dst());
        flow.set_rate(now, rate);
        self.expect_node_mut(src).peer.charge(Direction::Up, &delta);
        self.expect_node_mut(dst).peer.charge(Direction::Down, &delta);
        Ok(())
    }

    /// Accounts for the bytes a flow sent up to `now`.
    pub fn advance(&mut self, id: FlowId, now: SystemTime) -> Result<&Flow, Error> {
        let flow = self.flows.get_mut(&id).ok_or(Error::UnknownFlow(id))?;
        flow.advance(now);
        Ok(flow)
    }

    /// Reuses an active flow for the next message of the same pair.
    pub fn burst(&mut self, id: FlowId, now: SystemTime, size: u64) -> Result<&Flow, Error> {
        let flow = self.flows.get_mut(&id).ok_or(Error::UnknownFlow(id))?;
        flow.burst(now, size);
        Ok(flow)
    }

    /// Flows at `peer` in `direction` are locally bottlenecked if `peer` has no capacity left there.
    pub fn is_saturated(&self, peer: PeerId, direction: Direction) -> bool {
        self.peer(peer)
            .is_some_and(|peer| peer.is_saturated(direction))
    }

    /// Returns `true` if the flow is limited by the capacity of `at` itself.
    ///
    /// # Panics
    ///
    /// Panics if `at` is not an endpoint of the flow.
    pub fn is_locally_bottlenecked(&self, flow: &Flow, at: PeerId) -> bool {
        let direction = Self::side(flow, at);
        self.is_saturated(at, direction)
    }

    /// Returns `true` if the flow is limited by the endpoint opposite to `at`.
    ///
    /// # Panics
    ///
    /// Panics if `at` is not an endpoint of the flow.
    pub fn is_remotely_bottlenecked(&self, flow: &Flow, at: PeerId) -> bool {
        let side = Self::side(flow, at);
        let far = match side {
            Direction::Up => flow.dst(),
            Direction::Down => flow.src(),
        };
        self.is_saturated(far, side.opposite())
    }

    fn side(flow: &Flow, at: PeerId) -> Direction {
        if at == flow.src() {
            Direction::Up
        } else if at == flow.dst() {
            Direction::Down
        } else {
            panic!("{at} is neither source nor destination of {} -> {}", flow.src(), flow.dst());
        }
    }

    fn node(&self, id: PeerId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: PeerId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    fn expect_node(&self, id: PeerId) -> &Node {
        self.node(id)
            .unwrap_or_else(|| panic!("{id} referenced by a flow is not registered"))
    }

    fn expect_node_mut(&mut self, id: PeerId) -> &mut Node {
        self.node_mut(id)
            .unwrap_or_else(|| panic!("{id} referenced by a flow is not registered"))
    }

    fn expect_flow(&self, id: FlowId) -> &Flow {
        self.flows
            .get(&id)
            .unwrap_or_else(|| panic!("{id} is not live"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fairshare_utils::BigRationalExt;

    const NOW: SystemTime = SystemTime::UNIX_EPOCH;

    fn link(graph: &mut FlowGraph, src: PeerId, dst: PeerId, size: u64) -> FlowId {
        let (id, flow) = graph
            .prepare(src, dst, size, Duration::ZERO, NOW)
            .expect("valid flow");
        graph.insert(id, flow);
        id
    }

    #[test]
    fn test_adjacency_tracks_both_endpoints() {
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 10);
        let b = graph.add_peer(10, 10);
        let c = graph.add_peer(10, 10);

        let ab = link(&mut graph, a, b, 100);
        let cb = link(&mut graph, c, b, 100);

        assert_eq!(graph.uploads(a).collect::<Vec<_>>(), vec![ab]);
        assert_eq!(graph.downloads(b).collect::<Vec<_>>(), vec![ab, cb]);
        assert_eq!(graph.degree(b, Direction::Up), 0);
        assert_eq!(graph.flow_between(c, b), Some(cb));
        assert_eq!(graph.flow_between(b, c), None);

        graph.remove(ab).unwrap();
        assert_eq!(graph.uploads(a).count(), 0);
        assert_eq!(graph.downloads(b).collect::<Vec<_>>(), vec![cb]);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_remove_peer_requires_no_flows() {
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 10);
        let b = graph.add_peer(10, 10);
        let ab = link(&mut graph, a, b, 100);

        assert!(matches!(
            graph.remove_peer(a),
            Err(Error::PeerHasActiveFlows(peer)) if peer == a
        ));
        graph.remove(ab).unwrap();
        graph.remove_peer(a).unwrap();
        assert!(graph.peer(a).is_none());
        assert!(matches!(graph.remove_peer(a), Err(Error::UnknownPeer(_))));

        // Handles are never reused.
        let c = graph.add_peer(1, 1);
        assert_ne!(a, c);
    }

    #[test]
    fn test_prepare_rejects_invalid_pairs() {
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 10);
        let b = graph.add_peer(10, 10);

        assert!(matches!(
            graph.prepare(a, a, 1, Duration::ZERO, NOW),
            Err(Error::SelfTransfer(_))
        ));
        let ghost = PeerId::new(99);
        assert!(matches!(
            graph.prepare(a, ghost, 1, Duration::ZERO, NOW),
            Err(Error::UnknownPeer(peer)) if peer == ghost
        ));

        let ab = link(&mut graph, a, b, 1);
        assert!(matches!(
            graph.prepare(a, b, 1, Duration::ZERO, NOW),
            Err(Error::FlowExists(existing)) if existing == ab
        ));

        graph.peer_mut(b).unwrap().set_online(false);
        assert!(matches!(
            graph.prepare(b, a, 1, Duration::ZERO, NOW),
            Err(Error::PeerOffline(peer)) if peer == b
        ));
    }

    #[test]
    fn test_set_rate_updates_capacity() {
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 10);
        let b = graph.add_peer(10, 4);
        let ab = link(&mut graph, a, b, 100);

        graph.set_rate(ab, NOW, BigRational::from_u64(4)).unwrap();
        assert_eq!(graph.peer(a).unwrap().free(Direction::Up), &BigRational::from_u64(6));
        assert!(graph.is_saturated(b, Direction::Down));

        let flow = graph.flow(ab).unwrap();
        assert!(graph.is_locally_bottlenecked(flow, b));
        assert!(!graph.is_locally_bottlenecked(flow, a));
        assert!(graph.is_remotely_bottlenecked(flow, a));
        assert!(!graph.is_remotely_bottlenecked(flow, b));

        graph.remove(ab).unwrap();
        assert_eq!(graph.peer(b).unwrap().free(Direction::Down), &BigRational::from_u64(4));
    }

    #[test]
    fn test_negative_rate_rejected() {
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 10);
        let b = graph.add_peer(10, 10);
        let ab = link(&mut graph, a, b, 100);

        let negative = -BigRational::from_u64(1);
        assert!(matches!(
            graph.set_rate(ab, NOW, negative),
            Err(Error::InvalidRate(_))
        ));
        assert!(matches!(
            graph.set_rate(FlowId::new(42), NOW, BigRational::from_u64(1)),
            Err(Error::UnknownFlow(_))
        ));
    }

    #[test]
    fn test_detach_keeps_capacity_until_release() {
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 10);
        let b = graph.add_peer(10, 10);
        let ab = link(&mut graph, a, b, 100);
        graph.set_rate(ab, NOW, BigRational::from_u64(10)).unwrap();

        let flow = graph.detach(ab).unwrap();
        assert!(graph.is_saturated(a, Direction::Up));
        assert_eq!(graph.flow_between(a, b), None);

        graph.release(&flow);
        assert!(!graph.is_saturated(a, Direction::Up));
        assert!(!graph.is_saturated(b, Direction::Down));
    }

    #[test]
    #[should_panic(expected = "neither source nor destination")]
    fn test_bottleneck_query_requires_endpoint() {
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 10);
        let b = graph.add_peer(10, 10);
        let c = graph.add_peer(10, 10);
        let ab = link(&mut graph, a, b, 100);
        let flow = graph.flow(ab).unwrap();
        graph.is_locally_bottlenecked(flow, c);
    }
}
