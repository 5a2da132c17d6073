//! The node's replicated records.
//!
//! Every write to a replicated record goes through [`ReplicaStore`], under
//! one lock, so a broadcast and a gossip merge for the same id cannot
//! interleave their read-modify-write.

use parking_lot::Mutex;
use spiron_core::{unix_millis, Candidate, MetricEvent, MetricsSink, Store};
use spiron_crdt::{merge_optional, ApprovalCounter, FinalityDetector, ReplicatedRecord, ReplicatedVector};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct ReplicaStore {
    replica_id: String,
    store: Arc<dyn Store>,
    finality: FinalityDetector,
    finality_threshold: u64,
    metrics: Arc<dyn MetricsSink>,
    write_lock: Mutex<()>,
}

impl ReplicaStore {
    pub fn new(
        replica_id: impl Into<String>,
        store: Arc<dyn Store>,
        finality_threshold: u64,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            replica_id: replica_id.into(),
            store,
            finality: FinalityDetector::new(),
            finality_threshold,
            metrics,
            write_lock: Mutex::new(()),
        }
    }

    /// This replica's id.
    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn finality(&self) -> &FinalityDetector {
        &self.finality
    }

    /// Stored record for `id`. Unreadable records are logged and treated as absent.
    pub fn get(&self, id: &str) -> Option<ReplicatedRecord> {
        match self.store.get(id) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(id, error = %e, "stored record is unreadable");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(id, error = %e, "failed to read record");
                None
            }
        }
    }

    /// Every readable stored record.
    pub fn records(&self) -> BTreeMap<String, ReplicatedRecord> {
        let raw = match self.store.get_all() {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, "failed to list records");
                return BTreeMap::new();
            }
        };
        raw.into_iter()
            .filter_map(|(id, json)| match serde_json::from_str(&json) {
                Ok(record) => Some((id, record)),
                Err(e) => {
                    warn!(id = %id, error = %e, "skipping unreadable record");
                    None
                }
            })
            .collect()
    }

    fn save(&self, record: &ReplicatedRecord) {
        let written = serde_json::to_string(record)
            .map_err(spiron_core::Error::from)
            .and_then(|json| self.store.put(&record.id, &json));
        if let Err(e) = written {
            self.metrics.record(MetricEvent::PersistFailure);
            error!(id = %record.id, error = %e, "failed to persist record");
        }
    }

    fn check_finality(&self, record: &ReplicatedRecord) -> Option<u64> {
        let was_final = self.finality.is_finalized(&record.id);
        let result = self
            .finality
            .check_finality(&record.id, record, self.finality_threshold);
        if !was_final && result.is_some() {
            self.metrics.record(MetricEvent::Finalized);
        }
        result
    }

    /// Merge records from a peer. Returns the ids whose stored record changed.
    pub fn merge_remote(&self, remote: BTreeMap<String, ReplicatedRecord>) -> Vec<String> {
        let _guard = self.write_lock.lock();
        let mut changed = Vec::new();

        for (id, incoming) in remote {
            if incoming.id != id {
                warn!(key = %id, record = %incoming.id, "record id does not match its key, skipped");
                continue;
            }
            let local = self.get(&id);
            let Some(merged) = merge_optional(local.clone(), Some(incoming)) else {
                continue;
            };
            if local.as_ref() == Some(&merged) {
                continue;
            }

            self.save(&merged);
            self.metrics.record(MetricEvent::CrdtMerge);
            debug!(id = %id, approvals = merged.cumulative(), "merged remote record");
            self.check_finality(&merged);
            changed.push(id);
        }
        changed
    }

    /// Record a locally admitted candidate and this replica's approval of it.
    pub fn record_local_update(&self, candidate: &Candidate) -> ReplicatedRecord {
        self.record_local_update_at(candidate, unix_millis())
    }

    /// [`record_local_update`](Self::record_local_update) with an explicit timestamp.
    pub fn record_local_update_at(&self, candidate: &Candidate, timestamp: i64) -> ReplicatedRecord {
        let _guard = self.write_lock.lock();

        let fresh = ReplicatedRecord::new(
            candidate.id.clone(),
            ReplicatedVector::new(self.replica_id.clone(), timestamp, candidate.vector.clone()),
            ApprovalCounter::new(),
            timestamp,
        );
        let mut record = merge_optional(self.get(&candidate.id), Some(fresh.clone())).unwrap_or(fresh);
        record.approvals.increment(&self.replica_id);

        self.save(&record);
        if let Some(total) = self.check_finality(&record) {
            info!(id = %record.id, total, "record is final");
        }
        record
    }
}
