//! Last-writer-wins vector register.

use serde::{Deserialize, Serialize};

/// The current vector value for a candidate id, stamped by the replica that
/// wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedVector {
    /// Replica that produced this value
    pub replica_id: String,
    /// Write timestamp (unix millis on the writing replica)
    pub timestamp: i64,
    /// The vector itself
    pub vector: Vec<f64>,
}

impl ReplicatedVector {
    /// Create a new register value.
    pub fn new(replica_id: impl Into<String>, timestamp: i64, vector: Vec<f64>) -> Self {
        Self {
            replica_id: replica_id.into(),
            timestamp,
            vector,
        }
    }

    /// Whether `self` wins against `other` when passed as the first argument
    /// of [`merge_lww`].
    ///
    /// On a timestamp tie the first argument wins if its replica id sorts
    /// last or equal. Deployed replicas rely on this exact rule.
    pub fn wins_over(&self, other: &ReplicatedVector) -> bool {
        if self.timestamp != other.timestamp {
            return self.timestamp > other.timestamp;
        }
        self.replica_id >= other.replica_id
    }
}

/// Merge two register values, returning the winner.
pub fn merge_lww(v1: &ReplicatedVector, v2: &ReplicatedVector) -> ReplicatedVector {
    if v1.wins_over(v2) {
        v1.clone()
    } else {
        v2.clone()
    }
}
