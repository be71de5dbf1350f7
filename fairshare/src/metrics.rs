use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Counters maintained by a [crate::Controller].
#[derive(Default)]
pub struct Metrics {
    pub flows_created: Counter,
    pub bursts: Counter,
    pub completions: Counter,
    pub dropped: Counter,
    pub reallocations: Counter,
    pub affected_flows: Counter,
    pub widenings: Counter,
    pub live_flows: Gauge,
}

impl Metrics {
    /// Creates metrics and registers them under the `fairshare` prefix.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        let registry = registry.sub_registry_with_prefix("fairshare");
        registry.register(
            "flows_created",
            "flows created for an idle pair",
            metrics.flows_created.clone(),
        );
        registry.register(
            "bursts",
            "messages carried by an already active flow",
            metrics.bursts.clone(),
        );
        registry.register(
            "completions",
            "messages delivered",
            metrics.completions.clone(),
        );
        registry.register(
            "dropped",
            "messages dropped by a disconnect",
            metrics.dropped.clone(),
        );
        registry.register(
            "reallocations",
            "events that reallocated rates",
            metrics.reallocations.clone(),
        );
        registry.register(
            "affected_flows",
            "flows passed to the allocator",
            metrics.affected_flows.clone(),
        );
        registry.register(
            "widenings",
            "reallocations widened after failing certification",
            metrics.widenings.clone(),
        );
        registry.register(
            "live_flows",
            "flows currently active",
            metrics.live_flows.clone(),
        );
        metrics
    }
}
