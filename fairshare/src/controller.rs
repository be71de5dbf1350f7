//! Event handling for the flows of one simulation.
//!
//! The [Controller] owns all simulation state (peers, flows, queued messages, and the completion
//! schedule) and is driven by three kinds of events: a message is sent ([Controller::send]), the
//! earliest transfer completes ([Controller::on_wakeup]), or a peer disconnects
//! ([Controller::disconnect_peer]). Each event reallocates the affected flows and, if the
//! earliest completion moved, asks the [Scheduler] to call back at the new time.

use crate::{
    graph::{Event, FlowGraph, Subgraph},
    metrics::Metrics,
    Direction, Error, Flow, FlowId, Peer, PeerId, Schedule,
};
use num_rational::BigRational;
use num_traits::Zero;
use prometheus_client::registry::Registry;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tracing::{debug, trace};

/// Largest latency accepted by [Controller::set_latency] and [Config::default_latency].
pub const MAX_LATENCY: Duration = Duration::from_secs(u32::MAX as u64);

/// Source of simulated time and callbacks.
pub trait Scheduler {
    /// Current simulated time.
    fn now(&self) -> SystemTime;

    /// Requests a call to [Controller::on_wakeup] at `at`.
    ///
    /// Requests are never cancelled: a callback that finds nothing due is ignored.
    fn schedule(&mut self, at: SystemTime);
}

/// Configuration for a [Controller].
#[derive(Clone, Debug)]
pub struct Config {
    /// Reallocate only the flows discovered around each event.
    ///
    /// If `false`, every event reallocates every live flow.
    pub discovery: bool,

    /// Latency of pairs without a latency set by [Controller::set_latency].
    ///
    /// Must not exceed [MAX_LATENCY].
    pub default_latency: Duration,

    /// Registry to publish metrics to.
    pub registry: Option<Arc<Mutex<Registry>>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery: true,
            default_latency: Duration::ZERO,
            registry: None,
        }
    }
}

impl Config {
    /// Configuration that recomputes every rate on every event.
    pub fn full() -> Self {
        Self {
            discovery: false,
            ..Self::default()
        }
    }
}

/// Outcome of a message handed to [Controller::send].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion<M> {
    pub origin: PeerId,
    pub recipient: PeerId,
    pub message: M,
    pub size: u64,
    /// Time the last byte reaches the recipient, `None` if the message was dropped.
    pub deliver_at: Option<SystemTime>,
}

impl<M> Completion<M> {
    fn delivered(origin: PeerId, recipient: PeerId, pending: Pending<M>, at: SystemTime) -> Self {
        Self {
            origin,
            recipient,
            message: pending.message,
            size: pending.size,
            deliver_at: Some(at),
        }
    }

    fn dropped(origin: PeerId, recipient: PeerId, pending: Pending<M>) -> Self {
        Self {
            origin,
            recipient,
            message: pending.message,
            size: pending.size,
            deliver_at: None,
        }
    }

    /// Returns `true` if the message reached its recipient.
    pub const fn is_delivered(&self) -> bool {
        self.deliver_at.is_some()
    }
}

/// Snapshot of a [Controller]'s counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub flows_created: u64,
    pub bursts: u64,
    pub completions: u64,
    pub dropped: u64,
    pub reallocations: u64,
    pub affected_flows: u64,
    pub widenings: u64,
    pub live_flows: usize,
}

/// Message waiting for (or carried by) the flow of its pair.
struct Pending<M> {
    message: M,
    size: u64,
}

/// Owner of all flows of one simulation.
pub struct Controller<S, M> {
    scheduler: S,
    discovery: bool,
    default_latency: Duration,

    graph: FlowGraph,
    schedule: Schedule,
    queues: BTreeMap<(PeerId, PeerId), VecDeque<Pending<M>>>,
    latencies: BTreeMap<(PeerId, PeerId), Duration>,
    next_wakeup: Option<SystemTime>,

    metrics: Metrics,
}

impl<S: Scheduler, M> Controller<S, M> {
    /// Creates a controller without peers.
    ///
    /// # Panics
    ///
    /// Panics if `cfg.default_latency` exceeds [MAX_LATENCY].
    pub fn new(scheduler: S, cfg: Config) -> Self {
        assert!(
            cfg.default_latency <= MAX_LATENCY,
            "default latency {:?} exceeds maximum",
            cfg.default_latency
        );
        let metrics = match &cfg.registry {
            Some(registry) => Metrics::init(&mut registry.lock().unwrap()),
            None => Metrics::default(),
        };
        Self {
            scheduler,
            discovery: cfg.discovery,
            default_latency: cfg.default_latency,
            graph: FlowGraph::new(),
            schedule: Schedule::new(),
            queues: BTreeMap::new(),
            latencies: BTreeMap::new(),
            next_wakeup: None,
            metrics,
        }
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// Peers and flows as of the last event.
    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.graph.peer(id)
    }

    pub fn flow(&self, id: FlowId) -> Option<&Flow> {
        self.graph.flow(id)
    }

    /// Flow currently carrying messages from `src` to `dst`.
    pub fn flow_between(&self, src: PeerId, dst: PeerId) -> Option<FlowId> {
        self.graph.flow_between(src, dst)
    }

    /// Rate allocated to a flow (bytes per second).
    pub fn rate(&self, id: FlowId) -> Option<&BigRational> {
        self.graph.flow(id).map(Flow::rate)
    }

    /// Messages from `src` to `dst` not yet delivered, including the one in flight.
    pub fn queued(&self, src: PeerId, dst: PeerId) -> usize {
        self.queues.get(&(src, dst)).map_or(0, VecDeque::len)
    }

    /// Earliest projected completion, `None` if no flow is making progress.
    pub fn next_arrival(&self) -> Option<SystemTime> {
        self.schedule.next_arrival()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            flows_created: self.metrics.flows_created.get(),
            bursts: self.metrics.bursts.get(),
            completions: self.metrics.completions.get(),
            dropped: self.metrics.dropped.get(),
            reallocations: self.metrics.reallocations.get(),
            affected_flows: self.metrics.affected_flows.get(),
            widenings: self.metrics.widenings.get(),
            live_flows: self.graph.len(),
        }
    }

    /// Adds a peer with the given upload and download capacity (bytes per second).
    pub fn register_peer(&mut self, max_up: u64, max_down: u64) -> PeerId {
        let peer = self.graph.add_peer(max_up, max_down);
        debug!(%peer, max_up, max_down, "registered peer");
        peer
    }

    /// Removes a peer that no longer takes part in any flow.
    pub fn unregister_peer(&mut self, peer: PeerId) -> Result<Peer, Error> {
        let removed = self.graph.remove_peer(peer)?;
        self.latencies
            .retain(|(src, dst), _| *src != peer && *dst != peer);
        debug!(%peer, "unregistered peer");
        Ok(removed)
    }

    /// Sets the latency of flows created from `src` to `dst` from now on.
    ///
    /// Latencies above [MAX_LATENCY] are rejected with [Error::InvalidLatency].
    pub fn set_latency(
        &mut self,
        src: PeerId,
        dst: PeerId,
        latency: Duration,
    ) -> Result<(), Error> {
        if src == dst {
            return Err(Error::SelfTransfer(src));
        }
        if latency > MAX_LATENCY {
            return Err(Error::InvalidLatency(latency));
        }
        for peer in [src, dst] {
            self.graph.peer(peer).ok_or(Error::UnknownPeer(peer))?;
        }
        self.latencies.insert((src, dst), latency);
        Ok(())
    }

    /// Sends `size` bytes from `src` to `dst`.
    ///
    /// If the pair already has a flow, the message waits behind the messages it carries.
    /// Otherwise a flow is created and the affected flows are reallocated. Returns the projected
    /// completion of the transfer now in flight for the pair (`None` if it is stalled).
    pub fn send(
        &mut self,
        src: PeerId,
        dst: PeerId,
        message: M,
        size: u64,
    ) -> Result<Option<SystemTime>, Error> {
        let now = self.scheduler.now();

        // Queue behind the active flow
        if let Some(id) = self.graph.flow_between(src, dst) {
            let queue = self.queues.entry((src, dst)).or_default();
            queue.push_back(Pending { message, size });
            trace!(%id, %src, %dst, size, queued = queue.len(), "queued message");
            return Ok(self.graph.flow(id).and_then(Flow::deadline));
        }

        // Create a flow and find the flows it competes with
        let latency = self
            .latencies
            .get(&(src, dst))
            .copied()
            .unwrap_or(self.default_latency);
        let (id, flow) = self.graph.prepare(src, dst, size, latency, now)?;
        let subgraph = if self.discovery {
            self.graph.discover(id, &flow, Event::New)
        } else {
            let mut subgraph = self.graph.all();
            subgraph.insert(id, &flow);
            subgraph
        };
        assert!(subgraph.contains(id), "subgraph of {id} omits it");
        self.graph.insert(id, flow);
        self.queues
            .entry((src, dst))
            .or_default()
            .push_back(Pending { message, size });
        self.metrics.flows_created.inc();
        self.metrics.live_flows.set(self.graph.len() as i64);
        debug!(%id, %src, %dst, size, affected = subgraph.len(), "created flow");

        // Reallocate
        self.reallocate(now, subgraph);
        let deadline = self.graph.flow(id).and_then(Flow::deadline);
        self.schedule.reindex(id, deadline);
        self.reschedule();
        Ok(deadline)
    }

    /// Completes every transfer due at the current time.
    ///
    /// A pair with more queued messages keeps its flow (and rate) for the next message. Pairs
    /// left idle lose their flow, and the flows affected by all removals are reallocated at once.
    pub fn on_wakeup(&mut self) -> Vec<Completion<M>> {
        let now = self.scheduler.now();
        if self.next_wakeup.is_some_and(|at| at <= now) {
            self.next_wakeup = None;
        }

        let mut completions = Vec::new();
        let mut finished = Vec::new();
        while let Some(id) = self.schedule.take_arrival(now) {
            let flow = self.graph.advance(id, now).expect("scheduled flow is live");
            assert!(
                flow.remaining().is_zero(),
                "{id} due at {now:?} with {} bytes left",
                flow.remaining()
            );
            let (src, dst) = (flow.src(), flow.dst());
            let deliver_at = now
                .checked_add(flow.latency())
                .expect("deadline leaves room for latency");

            // Deliver the message in flight
            let queue = self
                .queues
                .get_mut(&(src, dst))
                .expect("active flow has a queue");
            let pending = queue.pop_front().expect("active flow carries a message");
            trace!(%id, %src, %dst, size = pending.size, "completed message");
            completions.push(Completion::delivered(src, dst, pending, deliver_at));
            self.metrics.completions.inc();

            // Burst the next message on the same flow
            if let Some(next) = queue.front() {
                let flow = self
                    .graph
                    .burst(id, now, next.size)
                    .expect("scheduled flow is live");
                self.schedule.reindex(id, flow.deadline());
                self.metrics.bursts.inc();
                continue;
            }
            self.queues.remove(&(src, dst));
            let flow = self.graph.detach(id).expect("scheduled flow is live");
            debug!(%id, %src, %dst, "finished flow");
            finished.push((id, flow));
        }

        if !finished.is_empty() {
            self.finish(now, finished);
        }
        self.reschedule();
        completions
    }

    /// Takes a peer offline, dropping every message to or from it.
    ///
    /// All flows of the peer finish at once and the flows they affected are reallocated in a
    /// single pass. The peer stays registered but rejects new transfers until
    /// [Controller::reconnect_peer].
    pub fn disconnect_peer(&mut self, peer: PeerId) -> Result<Vec<Completion<M>>, Error> {
        let now = self.scheduler.now();
        self.graph
            .peer_mut(peer)
            .ok_or(Error::UnknownPeer(peer))?
            .set_online(false);

        let incident: Vec<FlowId> = [Direction::Up, Direction::Down]
            .into_iter()
            .flat_map(|direction| self.graph.links(peer, direction))
            .collect();
        let mut dropped = Vec::new();
        let mut finished = Vec::with_capacity(incident.len());
        for id in incident {
            let flow = self.graph.detach(id)?;
            self.schedule.remove(id);
            let (src, dst) = (flow.src(), flow.dst());
            for pending in self.queues.remove(&(src, dst)).into_iter().flatten() {
                dropped.push(Completion::dropped(src, dst, pending));
                self.metrics.dropped.inc();
            }
            finished.push((id, flow));
        }
        debug!(
            %peer,
            flows = finished.len(),
            dropped = dropped.len(),
            "disconnected peer"
        );

        if !finished.is_empty() {
            self.finish(now, finished);
        }
        self.reschedule();
        Ok(dropped)
    }

    /// Allows a disconnected peer to take part in transfers again.
    pub fn reconnect_peer(&mut self, peer: PeerId) -> Result<(), Error> {
        self.graph
            .peer_mut(peer)
            .ok_or(Error::UnknownPeer(peer))?
            .set_online(true);
        debug!(%peer, "reconnected peer");
        Ok(())
    }

    /// Releases detached flows and reallocates everything they affected in one pass.
    fn finish(&mut self, now: SystemTime, finished: Vec<(FlowId, Flow)>) {
        // Discovery must observe the capacity the flows still hold
        let mut subgraph = Subgraph::new();
        for (id, flow) in &finished {
            self.schedule.remove(*id);
            if self.discovery {
                subgraph.extend(self.graph.discover(*id, flow, Event::Finished));
            } else {
                subgraph.touch(flow.src());
                subgraph.touch(flow.dst());
            }
        }
        for (_, flow) in &finished {
            self.graph.release(flow);
        }
        if !self.discovery {
            subgraph.extend(self.graph.all());
        }
        self.metrics.live_flows.set(self.graph.len() as i64);
        self.reallocate(now, subgraph);
    }

    /// Reallocates `subgraph` until every flow at its peers is certified fair.
    fn reallocate(&mut self, now: SystemTime, mut subgraph: Subgraph) {
        self.metrics.reallocations.inc();
        loop {
            self.metrics.affected_flows.inc_by(subgraph.len() as u64);
            let changed = self
                .graph
                .reallocate(now, subgraph.flows())
                .expect("reallocated flows are live");
            for id in changed {
                let deadline = self.graph.flow(id).and_then(Flow::deadline);
                self.schedule.reindex(id, deadline);
            }

            let violations = self.graph.violations(subgraph.peers());
            if violations.is_empty() {
                return;
            }

            // Pull in every flow competing with an unfair one
            self.metrics.widenings.inc();
            let before = subgraph.len();
            for id in &violations {
                self.widen(&mut subgraph, *id);
            }
            // A flow settled with its whole neighborhood is always certified
            assert!(
                subgraph.len() > before,
                "{} unfair flows remain after reallocating their neighborhoods",
                violations.len()
            );
            debug!(
                violations = violations.len(),
                flows = subgraph.len(),
                "widened reallocation"
            );
        }
    }

    fn widen(&self, subgraph: &mut Subgraph, id: FlowId) {
        let Some(flow) = self.graph.flow(id) else {
            return;
        };
        subgraph.insert(id, flow);
        for peer in [flow.src(), flow.dst()] {
            for direction in [Direction::Up, Direction::Down] {
                for other in self.graph.links(peer, direction) {
                    if let Some(competitor) = self.graph.flow(other) {
                        subgraph.insert(other, competitor);
                    }
                }
            }
        }
    }

    /// Requests a wakeup if the earliest completion moved.
    fn reschedule(&mut self) {
        let next = self.schedule.next_arrival();
        if next == self.next_wakeup {
            return;
        }
        self.next_wakeup = next;
        if let Some(at) = next {
            trace!(?at, "requesting wakeup");
            self.scheduler.schedule(at);
        }
    }
}
