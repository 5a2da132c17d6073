//! One-way finality latch.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

use crate::record::ReplicatedRecord;

/// Tracks which ids have reached finality.
///
/// The first record whose cumulative approvals reach the threshold is stored
/// and never replaced. Later checks report the stored total, not the total of
/// whatever record is passed in.
#[derive(Debug, Default)]
pub struct FinalityDetector {
    finalized: RwLock<HashMap<String, ReplicatedRecord>>,
}

impl FinalityDetector {
    /// Create an empty detector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `record` against `threshold`.
    ///
    /// Returns the cumulative approval count once `id` is final, `None`
    /// otherwise.
    pub fn check_finality(&self, id: &str, record: &ReplicatedRecord, threshold: u64) -> Option<u64> {
        if let Some(latched) = self.finalized.read().get(id) {
            return Some(latched.cumulative());
        }

        let cumulative = record.cumulative();
        if cumulative < threshold {
            return None;
        }

        let mut finalized = self.finalized.write();
        // Another caller may have latched between the two locks.
        let latched = finalized
            .entry(id.to_string())
            .or_insert_with(|| {
                info!(id, cumulative, threshold, "record reached finality");
                record.clone()
            });
        Some(latched.cumulative())
    }

    /// Whether `id` has been latched.
    pub fn is_finalized(&self, id: &str) -> bool {
        self.finalized.read().contains_key(id)
    }

    /// The latched snapshot for `id`.
    pub fn finalized_record(&self, id: &str) -> Option<ReplicatedRecord> {
        self.finalized.read().get(id).cloned()
    }

    /// Number of finalized ids.
    pub fn finalized_count(&self) -> usize {
        self.finalized.read().len()
    }

    /// Copy of every latched record.
    pub fn snapshot(&self) -> HashMap<String, ReplicatedRecord> {
        self.finalized.read().clone()
    }
}
