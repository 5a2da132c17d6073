//! The unit of replication and its merge.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::counter::ApprovalCounter;
use crate::lww::{merge_lww, ReplicatedVector};

/// Replicated state for one candidate id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedRecord {
    /// Candidate id
    pub id: String,
    /// LWW vector value
    pub state: ReplicatedVector,
    /// Approval G-Counter
    pub approvals: ApprovalCounter,
    /// Most recent update seen by any replica (unix millis)
    pub last_updated: i64,
}

impl ReplicatedRecord {
    /// Create a record.
    pub fn new(
        id: impl Into<String>,
        state: ReplicatedVector,
        approvals: ApprovalCounter,
        last_updated: i64,
    ) -> Self {
        Self {
            id: id.into(),
            state,
            approvals,
            last_updated,
        }
    }

    /// Cumulative approvals across all replicas.
    pub fn cumulative(&self) -> u64 {
        self.approvals.cumulative()
    }
}

/// Merge two records for the same id.
///
/// Commutative, associative and idempotent. The id is taken from `r1`.
pub fn merge(r1: &ReplicatedRecord, r2: &ReplicatedRecord) -> ReplicatedRecord {
    if r1 == r2 {
        return r1.clone();
    }

    let merged = ReplicatedRecord {
        id: r1.id.clone(),
        state: merge_lww(&r1.state, &r2.state),
        approvals: r1.approvals.merge(&r2.approvals),
        last_updated: r1.last_updated.max(r2.last_updated),
    };

    trace!(
        id = %merged.id,
        winner = %merged.state.replica_id,
        ts = merged.state.timestamp,
        approvals = merged.cumulative(),
        "merged replicated record"
    );

    merged
}

/// [`merge`] lifted over absent values: a missing side yields the other.
pub fn merge_optional(
    r1: Option<ReplicatedRecord>,
    r2: Option<ReplicatedRecord>,
) -> Option<ReplicatedRecord> {
    match (r1, r2) {
        (None, other) | (other, None) => other,
        (Some(a), Some(b)) => Some(merge(&a, &b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(replica: &str, ts: i64, approvals: &[(&str, u64)]) -> ReplicatedRecord {
        let mut counter = ApprovalCounter::new();
        for (r, n) in approvals {
            counter.set_at_least(r, *n);
        }
        ReplicatedRecord::new(
            "x",
            ReplicatedVector::new(replica, ts, vec![ts as f64]),
            counter,
            ts,
        )
    }

    #[test]
    fn missing_side_yields_other() {
        let a = rec("r1", 10, &[("r1", 1)]);
        assert_eq!(merge_optional(None, Some(a.clone())), Some(a.clone()));
        assert_eq!(merge_optional(Some(a.clone()), None), Some(a));
        assert_eq!(merge_optional(None, None), None);
    }

    #[test]
    fn identical_records_merge_to_themselves() {
        let a = rec("r1", 10, &[("r1", 1)]);
        assert_eq!(merge(&a, &a), a);
    }

    #[test]
    fn merge_combines_state_and_approvals() {
        let a = rec("r1", 100, &[("r1", 2)]);
        let b = rec("r2", 200, &[("r2", 1), ("r1", 1)]);

        let m = merge(&a, &b);
        assert_eq!(m.state.timestamp, 200);
        assert_eq!(m.state.replica_id, "r2");
        assert_eq!(m.approvals.get("r1"), 2);
        assert_eq!(m.approvals.get("r2"), 1);
        assert_eq!(m.last_updated, 200);
    }

    #[test]
    fn record_json_roundtrip() {
        let a = rec("r1", 100, &[("r1", 2)]);
        let json = serde_json::to_string(&a).unwrap();
        let back: ReplicatedRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }
}
