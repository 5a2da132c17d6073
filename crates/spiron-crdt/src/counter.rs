//! Grow-only approval counter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// G-Counter of approvals, one slot per replica.
///
/// A slot only ever grows. The cumulative value is the sum over all slots.
/// Stored in a `BTreeMap` so equality and serialization are order-independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovalCounter {
    per_replica: BTreeMap<String, u64>,
}

impl ApprovalCounter {
    /// Create an empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a counter from raw per-replica values.
    pub fn from_map(per_replica: BTreeMap<String, u64>) -> Self {
        Self { per_replica }
    }

    /// Record one more approval from `replica_id`.
    ///
    /// Only the owning replica should increment its own slot.
    pub fn increment(&mut self, replica_id: &str) {
        let slot = self.per_replica.entry(replica_id.to_string()).or_insert(0);
        *slot = slot.saturating_add(1);
    }

    /// Raise a slot to at least `value`. Lower values are ignored.
    pub fn set_at_least(&mut self, replica_id: &str, value: u64) {
        let slot = self.per_replica.entry(replica_id.to_string()).or_insert(0);
        *slot = (*slot).max(value);
    }

    /// Approvals recorded for one replica.
    pub fn get(&self, replica_id: &str) -> u64 {
        self.per_replica.get(replica_id).copied().unwrap_or(0)
    }

    /// Sum over every replica.
    pub fn cumulative(&self) -> u64 {
        self.per_replica
            .values()
            .fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Per-replica view.
    pub fn per_replica(&self) -> &BTreeMap<String, u64> {
        &self.per_replica
    }

    /// No approvals at all.
    pub fn is_empty(&self) -> bool {
        self.cumulative() == 0
    }

    /// Key-set union with per-key max.
    pub fn merge(&self, other: &ApprovalCounter) -> ApprovalCounter {
        let mut merged = self.clone();
        merged.merge_from(other);
        merged
    }

    /// In-place variant of [`merge`](Self::merge).
    pub fn merge_from(&mut self, other: &ApprovalCounter) {
        for (replica, value) in &other.per_replica {
            self.set_at_least(replica, *value);
        }
    }
}
