//! The dominance state machine.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::candidate::Candidate;
use crate::lineage::LineageTracker;
use crate::metrics::{MetricEvent, MetricsSink};
use crate::similarity::{angular_similarity, siphon};
use crate::store::CommitJournal;
use crate::unix_millis;

/// Prefix of every commit line in the journal.
pub const COMMIT_LOG_TAG: &str = "commit:";

/// Tuning for merge and commit.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineParams {
    /// Energy multiplier applied when an update disagrees with the standing version
    pub damping_alpha: f64,
    /// Share of the incoming energy absorbed on agreement
    pub siphon_factor: f64,
    /// Similarity above which two versions agree
    pub angular_threshold: f64,
    /// Minimum energy for a candidate to be committed
    pub commit_energy: f64,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            damping_alpha: 0.85,
            siphon_factor: 0.45,
            angular_threshold: 0.6,
            commit_energy: 1.0,
        }
    }
}

impl EngineParams {
    #[must_use]
    pub fn with_damping_alpha(mut self, alpha: f64) -> Self {
        self.damping_alpha = alpha;
        self
    }

    #[must_use]
    pub fn with_siphon_factor(mut self, factor: f64) -> Self {
        self.siphon_factor = factor;
        self
    }

    #[must_use]
    pub fn with_angular_threshold(mut self, threshold: f64) -> Self {
        self.angular_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_commit_energy(mut self, energy: f64) -> Self {
        self.commit_energy = energy;
        self
    }
}

/// Hands committed candidates to the rest of the cluster.
pub trait CommitPropagator: Send + Sync {
    /// Start delivering `candidate` to every peer. Must not wait for delivery.
    fn propagate_commit(&self, candidate: &Candidate);
}

#[derive(Default)]
struct EngineState {
    candidates: HashMap<String, Candidate>,
    last_committed: Option<Candidate>,
}

/// Id-keyed candidate map with merge, damping and commit.
///
/// Every operation that touches the map runs under one mutex. Per-operation
/// cost is linear in the vector dimension, and commits are rare, so the
/// coarse lock is not a bottleneck.
pub struct DominanceEngine {
    params: EngineParams,
    state: Mutex<EngineState>,
    journal: Option<Arc<dyn CommitJournal>>,
    lineage: Option<LineageTracker>,
    propagator: Option<Arc<dyn CommitPropagator>>,
    metrics: Arc<dyn MetricsSink>,
}

impl DominanceEngine {
    /// Create an engine with no persistence and no peers.
    pub fn new(params: EngineParams, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            params,
            state: Mutex::new(EngineState::default()),
            journal: None,
            lineage: None,
            propagator: None,
            metrics,
        }
    }

    /// Attach the commit journal and recover the last committed snapshot.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<dyn CommitJournal>) -> Self {
        match journal.load_snapshot() {
            Ok(Some(snapshot)) => {
                info!(id = %snapshot.id, energy = snapshot.energy, "recovered committed snapshot");
                let mut state = self.state.lock();
                state.candidates.insert(snapshot.id.clone(), snapshot.clone());
                state.last_committed = Some(snapshot);
            }
            Ok(None) => debug!("no committed snapshot to recover"),
            Err(e) => warn!(error = %e, "failed to load committed snapshot"),
        }
        self.journal = Some(journal);
        self
    }

    #[must_use]
    pub fn with_lineage(mut self, lineage: LineageTracker) -> Self {
        self.lineage = Some(lineage);
        self
    }

    #[must_use]
    pub fn with_propagator(mut self, propagator: Arc<dyn CommitPropagator>) -> Self {
        self.propagator = Some(propagator);
        self
    }

    /// Engine tuning.
    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    /// Combine the standing version of an id with an incoming one.
    ///
    /// Agreement absorbs the incoming energy and records the incoming id as
    /// parent. Disagreement damps the standing energy and leaves the rest
    /// alone.
    pub fn merge(&self, existing: &Candidate, incoming: &Candidate) -> Candidate {
        let sim = angular_similarity(&existing.vector, &incoming.vector);

        if sim > self.params.angular_threshold {
            let energy = siphon(existing.energy, incoming.energy, sim, self.params.siphon_factor);
            self.metrics.record(MetricEvent::Merge);
            debug!(id = %existing.id, sim, from = existing.energy, to = energy, "absorbed");
            existing.absorbing(energy, &incoming.id)
        } else {
            let energy = existing.energy * self.params.damping_alpha;
            self.metrics.record(MetricEvent::Damping);
            debug!(id = %existing.id, sim, from = existing.energy, to = energy, "damped");
            existing.with_energy(energy)
        }
    }

    /// Upsert `candidate`, merging with any standing version.
    ///
    /// Returns the version now stored.
    pub fn ingest(&self, candidate: Candidate) -> Candidate {
        let started = Instant::now();
        let mut state = self.state.lock();

        let stored = match state.candidates.get(&candidate.id) {
            Some(existing) => self.merge(existing, &candidate),
            None => candidate,
        };
        state.candidates.insert(stored.id.clone(), stored.clone());
        drop(state);

        self.metrics.record(MetricEvent::Ingest);
        self.metrics.observe_latency(MetricEvent::Ingest, started.elapsed());
        stored
    }

    /// Highest-energy candidate at or above the commit energy.
    ///
    /// Equal energies go to the lexicographically smallest id.
    pub fn dominant(&self) -> Option<Candidate> {
        let state = self.state.lock();
        select_dominant(&state.candidates, self.params.commit_energy).cloned()
    }

    /// Commit the dominant candidate if it changed since the last commit.
    ///
    /// A dominant equal to the last committed one is not committed again.
    ///
    /// Writes the journal, records lineage and hands the candidate to the
    /// propagator. Returns the candidate committed by this call.
    pub fn check_and_commit(&self) -> Option<Candidate> {
        let started = Instant::now();
        let mut state = self.state.lock();
        let dominant = select_dominant(&state.candidates, self.params.commit_energy)?.clone();

        if state.last_committed.as_ref() == Some(&dominant) {
            return None;
        }

        self.persist_locked(&mut state, &dominant);
        state.last_committed = Some(dominant.clone());
        drop(state);

        if let Some(lineage) = &self.lineage {
            lineage.record_lineage(&dominant.id, dominant.parent_id.as_deref());
        }
        if let Some(propagator) = &self.propagator {
            propagator.propagate_commit(&dominant);
        }

        self.metrics.record(MetricEvent::Commit);
        self.metrics.observe_latency(MetricEvent::Commit, started.elapsed());
        info!(id = %dominant.id, energy = dominant.energy, "committed dominant candidate");
        Some(dominant)
    }

    /// Durably record `candidate` as committed and make it the stored version.
    ///
    /// Journal failures are logged; the in-memory map is updated regardless.
    pub fn persist_state(&self, candidate: Candidate) {
        let mut state = self.state.lock();
        self.persist_locked(&mut state, &candidate);
    }

    fn persist_locked(&self, state: &mut EngineState, candidate: &Candidate) {
        if let Some(journal) = &self.journal {
            let entry = format!(
                "{} {}{},{}",
                unix_millis(),
                COMMIT_LOG_TAG,
                candidate.id,
                candidate.energy
            );
            let written = journal
                .append_log(&entry)
                .and_then(|()| journal.save_snapshot(candidate));
            if let Err(e) = written {
                self.metrics.record(MetricEvent::PersistFailure);
                error!(id = %candidate.id, error = %e, "failed to persist commit");
            }
        }
        state
            .candidates
            .insert(candidate.id.clone(), candidate.clone());
    }

    /// Every stored candidate, ordered by id.
    pub fn snapshot(&self) -> Vec<Candidate> {
        let state = self.state.lock();
        let mut all: Vec<_> = state.candidates.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Stored version of `id`.
    pub fn get(&self, id: &str) -> Option<Candidate> {
        self.state.lock().candidates.get(id).cloned()
    }

    /// Number of stored candidates.
    pub fn len(&self) -> usize {
        self.state.lock().candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count the commits recorded in the journal.
    pub fn replay_log(&self) -> usize {
        let Some(journal) = &self.journal else {
            return 0;
        };
        match journal.read_log() {
            Ok(lines) => {
                let commits = lines.iter().filter(|l| l.contains(COMMIT_LOG_TAG)).count();
                info!(entries = lines.len(), commits, "replayed commit log");
                commits
            }
            Err(e) => {
                error!(error = %e, "failed to read commit log");
                0
            }
        }
    }
}

fn select_dominant(candidates: &HashMap<String, Candidate>, commit_energy: f64) -> Option<&Candidate> {
    candidates
        .values()
        .filter(|c| c.energy >= commit_energy)
        .fold(None, |best: Option<&Candidate>, c| match best {
            Some(b) if b.energy > c.energy || (b.energy == c.energy && b.id < c.id) => Some(b),
            _ => Some(c),
        })
}
