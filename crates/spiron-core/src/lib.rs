//! Spiron Dominance Engine
//!
//! Candidates ("eddies") compete for dominance by energy. When two versions
//! of an id point the same way they pool their energy; when they disagree the
//! standing version pays for it.
//!
//! # Energy Rules
//!
//! ```text
//! sim = dot(a, b) / (|a| |b| + 1e-9)
//!
//! sim >  threshold  →  energy' = energy + factor · sim · incoming   (absorb)
//! sim <= threshold  →  energy' = energy · alpha                     (damp)
//! ```
//!
//! The dominant candidate is the highest-energy entry at or above the commit
//! energy, ties broken by the smallest id. Committing it writes the durable
//! journal, records lineage and hands the candidate to the peers.
//!
//! # Collaborators
//!
//! - [`Store`] / [`CommitJournal`]: persistence, embedded or distributed
//! - [`CommitPropagator`]: outbound commit fan-out
//! - [`MetricsSink`]: observational counters, passed in explicitly

mod candidate;
mod engine;
pub mod error;
pub mod lineage;
pub mod metrics;
mod similarity;
pub mod store;

pub use candidate::Candidate;
pub use engine::{CommitPropagator, DominanceEngine, EngineParams};
pub use error::{Error, Result};
pub use lineage::{LineageRecord, LineageTracker};
pub use metrics::{MetricEvent, MetricsSink, NoopMetrics, PrometheusMetrics};
pub use similarity::{angular_similarity, dot, norm, siphon, EPSILON};
pub use store::{CommitJournal, MemoryStore, RateBucketState, Store};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock unix milliseconds.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
