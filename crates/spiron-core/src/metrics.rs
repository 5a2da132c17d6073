//! Metrics sink passed into each component.
//!
//! Metrics are observational only: nothing reads them back to make a
//! decision. [`PrometheusMetrics`] keeps its own registry per node, so two
//! nodes in one process never share counters.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Countable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricEvent {
    /// Candidate ingested into the engine
    Ingest,
    /// Incoming version absorbed
    Merge,
    /// Existing version damped
    Damping,
    /// Dominant candidate committed
    Commit,
    /// Broadcast cleared admission
    BroadcastAccepted,
    /// Broadcast from a peer outside the allowlist
    RejectedAllowlist,
    /// Broadcast over the peer's rate
    RejectedRateLimit,
    /// Broadcast failed structural validation
    RejectedValidation,
    /// Broadcast seen inside the dedup window
    RejectedDuplicate,
    /// Replicated records merged by gossip
    CrdtMerge,
    /// Gossip round completed
    GossipRound,
    /// Gossip round abandoned
    GossipFailure,
    /// Record latched as final
    Finalized,
    /// Outbound call failed after retries
    OutboundFailure,
    /// Outbound call short-circuited by an open breaker
    CircuitOpen,
    /// Durable write failed
    PersistFailure,
    /// Inbound broadcast handled
    RpcBroadcast,
    /// Inbound commit handled
    RpcCommit,
    /// Inbound sync handled
    RpcSync,
}

impl MetricEvent {
    /// Every event, in declaration order.
    pub const ALL: [MetricEvent; 19] = [
        MetricEvent::Ingest,
        MetricEvent::Merge,
        MetricEvent::Damping,
        MetricEvent::Commit,
        MetricEvent::BroadcastAccepted,
        MetricEvent::RejectedAllowlist,
        MetricEvent::RejectedRateLimit,
        MetricEvent::RejectedValidation,
        MetricEvent::RejectedDuplicate,
        MetricEvent::CrdtMerge,
        MetricEvent::GossipRound,
        MetricEvent::GossipFailure,
        MetricEvent::Finalized,
        MetricEvent::OutboundFailure,
        MetricEvent::CircuitOpen,
        MetricEvent::PersistFailure,
        MetricEvent::RpcBroadcast,
        MetricEvent::RpcCommit,
        MetricEvent::RpcSync,
    ];

    /// Stable snake_case name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Merge => "merge",
            Self::Damping => "damping",
            Self::Commit => "commit",
            Self::BroadcastAccepted => "broadcast_accepted",
            Self::RejectedAllowlist => "rejected_allowlist",
            Self::RejectedRateLimit => "rejected_ratelimit",
            Self::RejectedValidation => "rejected_validation",
            Self::RejectedDuplicate => "rejected_duplicate",
            Self::CrdtMerge => "crdt_merge",
            Self::GossipRound => "gossip_round",
            Self::GossipFailure => "gossip_failure",
            Self::Finalized => "finalized",
            Self::OutboundFailure => "outbound_failure",
            Self::CircuitOpen => "circuit_open",
            Self::PersistFailure => "persist_failure",
            Self::RpcBroadcast => "rpc_broadcast",
            Self::RpcCommit => "rpc_commit",
            Self::RpcSync => "rpc_sync",
        }
    }
}

impl fmt::Display for MetricEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Destination for counters and timings.
pub trait MetricsSink: Send + Sync {
    /// Count one occurrence of `event`.
    fn record(&self, event: MetricEvent);

    /// Record how long an operation tied to `event` took.
    fn observe_latency(&self, _event: MetricEvent, _elapsed: Duration) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: MetricEvent) {}
}

// Latency buckets: 100µs to 10s
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Prometheus counters and latency histograms, labelled by event.
///
/// - `spiron_events_total{event}`
/// - `spiron_latency_seconds{event}`
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    events: IntCounterVec,
    latency: HistogramVec,
}

impl PrometheusMetrics {
    /// Create the metrics and register them in a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events = IntCounterVec::new(
            Opts::new("spiron_events_total", "Engine, admission, gossip and RPC events"),
            &["event"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("spiron_latency_seconds", "Time spent per event")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["event"],
        )?;

        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            registry,
            events,
            latency,
        })
    }

    /// The node's registry, for scraping or adding collectors.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current count for `event`.
    pub fn count(&self, event: MetricEvent) -> u64 {
        self.events.with_label_values(&[event.name()]).get()
    }

    /// Number of latency observations for `event`.
    pub fn latency_samples(&self, event: MetricEvent) -> u64 {
        self.latency.with_label_values(&[event.name()]).get_sample_count()
    }

    /// Total observed latency for `event`.
    pub fn total_latency(&self, event: MetricEvent) -> Duration {
        let seconds = self.latency.with_label_values(&[event.name()]).get_sample_sum();
        Duration::try_from_secs_f64(seconds).unwrap_or_default()
    }

    /// Non-zero counters, in declaration order.
    pub fn snapshot(&self) -> Vec<(MetricEvent, u64)> {
        MetricEvent::ALL
            .iter()
            .map(|e| (*e, self.count(*e)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::Error::Metrics(e.to_string()))
    }
}

impl fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusMetrics")
            .field("events", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record(&self, event: MetricEvent) {
        self.events.with_label_values(&[event.name()]).inc();
    }

    fn observe_latency(&self, event: MetricEvent, elapsed: Duration) {
        self.latency
            .with_label_values(&[event.name()])
            .observe(elapsed.as_secs_f64());
    }
}
