//! Max-min fair water-filling over a subset of the live flows.
//!
//! Allocation is split into a pure [FlowGraph::plan] (computes the new rate of every flow in the
//! subset while every other flow keeps its rate) and [FlowGraph::apply] (writes the rates back,
//! keeping peer capacity consistent). [FlowGraph::violations] certifies a result: an allocation
//! is max-min fair exactly when every flow has a saturated endpoint at which no other flow is
//! faster.

use super::FlowGraph;
use crate::{Direction, Error, FlowId, PeerId};
use fairshare_utils::BigRationalExt;
use num_rational::BigRational;
use num_traits::{Signed, Zero};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::SystemTime,
};

/// New rate of every flow in an allocated subset.
pub type Plan = BTreeMap<FlowId, BigRational>;

/// Working state of one peer direction while planning.
struct Slot {
    free: BigRational,
    unsettled: BTreeSet<FlowId>,
}

impl Slot {
    /// Fair share of the remaining capacity, `None` once every flow here is settled.
    fn share(&self) -> Option<BigRational> {
        if self.unsettled.is_empty() {
            return None;
        }
        if !self.free.is_positive() {
            return Some(BigRational::zero());
        }
        Some(&self.free / BigRational::from_usize(self.unsettled.len()))
    }
}

impl FlowGraph {
    /// Computes max-min fair rates for `flows`, holding every flow outside the set fixed.
    ///
    /// Rates of the set are treated as zero (their capacity returned to both endpoints). Each
    /// round finds the smallest fair share `R` over all peer directions with unsettled flows and
    /// settles every unsettled flow at every direction achieving `R`, on the upload and download
    /// side alike.
    ///
    /// # Panics
    ///
    /// Panics if `flows` names a flow that is not live.
    pub fn plan(&self, flows: &BTreeSet<FlowId>) -> Plan {
        let mut slots: BTreeMap<(PeerId, Direction), Slot> = BTreeMap::new();
        for &id in flows {
            let flow = self.expect_flow(id);
            for (peer, direction) in [(flow.src(), Direction::Up), (flow.dst(), Direction::Down)] {
                let slot = slots.entry((peer, direction)).or_insert_with(|| Slot {
                    free: self.expect_node(peer).peer.free(direction).clone(),
                    unsettled: BTreeSet::new(),
                });
                slot.free += flow.rate();
                slot.unsettled.insert(id);
            }
        }

        let mut plan = Plan::new();
        while plan.len() < flows.len() {
            // Find the bottleneck level of this round.
            let Some(level) = slots.values().filter_map(Slot::share).min() else {
                break;
            };

            // Every direction achieving the level is settled in the same round, so an exact tie
            // between an upload and a download side resolves both at once.
            let mut settle = BTreeSet::new();
            for slot in slots.values() {
                if slot.share().as_ref() == Some(&level) {
                    settle.extend(slot.unsettled.iter().copied());
                }
            }
            assert!(!settle.is_empty(), "allocation round settled no flow");

            for id in settle {
                let flow = self.expect_flow(id);
                for key in [(flow.src(), Direction::Up), (flow.dst(), Direction::Down)] {
                    let slot = slots
                        .get_mut(&key)
                        .expect("every endpoint of a planned flow has a slot");
                    slot.unsettled.remove(&id);
                    slot.free -= &level;
                }
                plan.insert(id, level.clone());
            }
        }
        plan
    }

    /// Writes `plan` back to the graph and returns the flows whose rate changed.
    ///
    /// Decreases are applied before increases so no peer is ever charged beyond its capacity,
    /// even transiently.
    pub fn apply(&mut self, now: SystemTime, plan: Plan) -> Result<Vec<FlowId>, Error> {
        let mut decreases = Vec::new();
        let mut increases = Vec::new();
        for (id, rate) in plan {
            let current = self.flow(id).ok_or(Error::UnknownFlow(id))?.rate();
            match rate.cmp(current) {
                std::cmp::Ordering::Less => decreases.push((id, rate)),
                std::cmp::Ordering::Greater => increases.push((id, rate)),
                std::cmp::Ordering::Equal => {}
            }
        }

        let mut changed = Vec::with_capacity(decreases.len() + increases.len());
        for (id, rate) in decreases.into_iter().chain(increases) {
            self.set_rate(id, now, rate)?;
            changed.push(id);
        }
        Ok(changed)
    }

    /// Plans and applies a max-min fair allocation of `flows`.
    pub fn reallocate(
        &mut self,
        now: SystemTime,
        flows: &BTreeSet<FlowId>,
    ) -> Result<Vec<FlowId>, Error> {
        let plan = self.plan(flows);
        self.apply(now, plan)
    }

    /// Returns the endpoint direction limiting a flow: saturated, with no faster flow there.
    ///
    /// A flow without such a bottleneck could be sped up without slowing down a flow that is
    /// already slower, so the allocation is not max-min fair.
    pub fn bottleneck(&self, id: FlowId) -> Option<(PeerId, Direction)> {
        let flow = self.flow(id)?;
        [(flow.src(), Direction::Up), (flow.dst(), Direction::Down)]
            .into_iter()
            .find(|&(peer, direction)| {
                self.is_saturated(peer, direction)
                    && self
                        .links(peer, direction)
                        .filter_map(|other| self.flow(other))
                        .all(|other| other.rate() <= flow.rate())
            })
    }

    /// Flows taking part at any of `peers` that have no bottleneck.
    pub fn violations<'a>(&self, peers: impl IntoIterator<Item = &'a PeerId>) -> BTreeSet<FlowId> {
        let mut checked = BTreeSet::new();
        let mut violations = BTreeSet::new();
        for &peer in peers {
            for direction in [Direction::Up, Direction::Down] {
                for id in self.links(peer, direction) {
                    if checked.insert(id) && self.bottleneck(id).is_none() {
                        violations.insert(id);
                    }
                }
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const NOW: SystemTime = SystemTime::UNIX_EPOCH;

    fn link(graph: &mut FlowGraph, src: PeerId, dst: PeerId) -> FlowId {
        let (id, flow) = graph
            .prepare(src, dst, 1_000, Duration::ZERO, NOW)
            .expect("valid flow");
        graph.insert(id, flow);
        id
    }

    fn rate(graph: &FlowGraph, id: FlowId) -> BigRational {
        graph.flow(id).unwrap().rate().clone()
    }

    fn everything(graph: &FlowGraph) -> BTreeSet<FlowId> {
        graph.flows().map(|(id, _)| id).collect()
    }

    #[test]
    fn test_single_flow_takes_the_narrowest_side() {
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 0);
        let b = graph.add_peer(0, 10);
        let ab = link(&mut graph, a, b);

        let changed = graph.reallocate(NOW, &everything(&graph)).unwrap();
        assert_eq!(changed, vec![ab]);
        assert_eq!(rate(&graph, ab), BigRational::from_u64(10));
        assert!(graph.is_saturated(a, Direction::Up));
        assert!(graph.is_saturated(b, Direction::Down));
        assert!(graph.violations(&[a, b]).is_empty());
    }

    #[test]
    fn test_upload_shared_evenly() {
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 0);
        let b = graph.add_peer(0, 100);
        let c = graph.add_peer(0, 100);
        let ab = link(&mut graph, a, b);
        let ac = link(&mut graph, a, c);

        graph.reallocate(NOW, &everything(&graph)).unwrap();
        assert_eq!(rate(&graph, ab), BigRational::from_u64(5));
        assert_eq!(rate(&graph, ac), BigRational::from_u64(5));
        assert_eq!(graph.bottleneck(ab), Some((a, Direction::Up)));
    }

    #[test]
    fn test_leftover_capacity_flows_to_unconstrained() {
        // a uploads to b (download 2) and c (download 100): b caps its flow, c takes the rest.
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 0);
        let b = graph.add_peer(0, 2);
        let c = graph.add_peer(0, 100);
        let ab = link(&mut graph, a, b);
        let ac = link(&mut graph, a, c);

        graph.reallocate(NOW, &everything(&graph)).unwrap();
        assert_eq!(rate(&graph, ab), BigRational::from_u64(2));
        assert_eq!(rate(&graph, ac), BigRational::from_u64(8));
        assert_eq!(graph.bottleneck(ab), Some((b, Direction::Down)));
        assert_eq!(graph.bottleneck(ac), Some((a, Direction::Up)));
    }

    #[test]
    fn test_exact_thirds() {
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 0);
        let sinks: Vec<_> = (0..3).map(|_| graph.add_peer(0, 100)).collect();
        let flows: Vec<_> = sinks.iter().map(|&sink| link(&mut graph, a, sink)).collect();

        graph.reallocate(NOW, &everything(&graph)).unwrap();
        for id in flows {
            assert_eq!(rate(&graph, id), BigRational::from_frac_u64(10, 3));
        }
        assert!(graph.is_saturated(a, Direction::Up));
    }

    #[test]
    fn test_tie_between_upload_and_download_settles_both() {
        // Upload share at a and download share at d are both 5 in the first round.
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 0);
        let b = graph.add_peer(0, 100);
        let c = graph.add_peer(0, 100);
        let x = graph.add_peer(100, 0);
        let y = graph.add_peer(100, 0);
        let d = graph.add_peer(0, 10);
        let ab = link(&mut graph, a, b);
        let ac = link(&mut graph, a, c);
        let xd = link(&mut graph, x, d);
        let yd = link(&mut graph, y, d);

        let plan = graph.plan(&everything(&graph));
        assert_eq!(plan.len(), 4);
        for id in [ab, ac, xd, yd] {
            assert_eq!(plan[&id], BigRational::from_u64(5));
        }
    }

    #[test]
    fn test_plan_holds_outside_flows_fixed() {
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 0);
        let b = graph.add_peer(0, 100);
        let c = graph.add_peer(0, 100);
        let ab = link(&mut graph, a, b);
        graph.set_rate(ab, NOW, BigRational::from_u64(7)).unwrap();
        let ac = link(&mut graph, a, c);

        // Only the new flow is reallocated: it receives what ab leaves behind.
        graph.reallocate(NOW, &BTreeSet::from([ac])).unwrap();
        assert_eq!(rate(&graph, ab), BigRational::from_u64(7));
        assert_eq!(rate(&graph, ac), BigRational::from_u64(3));

        // ac has the same saturated side as ab but is slower: not fair.
        assert_eq!(graph.violations(&[a]), BTreeSet::from([ac]));
    }

    #[test]
    fn test_zero_capacity_direction_yields_zero_rate() {
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(0, 0);
        let b = graph.add_peer(0, 10);
        let c = graph.add_peer(10, 0);
        let ab = link(&mut graph, a, b);
        let cb = link(&mut graph, c, b);

        graph.reallocate(NOW, &everything(&graph)).unwrap();
        assert!(rate(&graph, ab).is_zero());
        assert_eq!(rate(&graph, cb), BigRational::from_u64(10));
        assert_eq!(graph.flow(ab).unwrap().deadline(), None);
        assert!(graph.violations(&[a, b, c]).is_empty());
    }

    #[test]
    fn test_apply_reports_only_changes() {
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 0);
        let b = graph.add_peer(0, 10);
        link(&mut graph, a, b);

        let all = everything(&graph);
        assert_eq!(graph.reallocate(NOW, &all).unwrap().len(), 1);
        assert!(graph.reallocate(NOW, &all).unwrap().is_empty());
    }

    #[test]
    fn test_apply_decreases_before_increases() {
        // Shifting capacity between two flows at a saturated peer must not overcommit it.
        let mut graph = FlowGraph::new();
        let a = graph.add_peer(10, 0);
        let b = graph.add_peer(0, 100);
        let c = graph.add_peer(0, 100);
        let ab = link(&mut graph, a, b);
        let ac = link(&mut graph, a, c);
        graph.set_rate(ab, NOW, BigRational::from_u64(2)).unwrap();
        graph.set_rate(ac, NOW, BigRational::from_u64(8)).unwrap();

        let plan = Plan::from([
            (ab, BigRational::from_u64(8)),
            (ac, BigRational::from_u64(2)),
        ]);
        let changed = graph.apply(NOW, plan).unwrap();
        assert_eq!(changed, vec![ac, ab]);
        assert!(graph.is_saturated(a, Direction::Up));
    }
}
