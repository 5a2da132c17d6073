//! Absorption lineage.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::Result;
use crate::store::Store;
use crate::unix_millis;

/// Stored lineage for one candidate id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    /// Ancestors, oldest first
    pub ancestry: Vec<String>,
    /// When the entry was written (unix millis)
    pub timestamp: i64,
}

/// Records which candidate absorbed which.
///
/// A child's ancestry is its parent's ancestry followed by the parent.
/// Failures are logged and swallowed: lineage never blocks a commit.
#[derive(Clone)]
pub struct LineageTracker {
    store: Arc<dyn Store>,
}

impl LineageTracker {
    /// Create a tracker over `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record that `id` descends from `parent`. A missing parent is a no-op.
    pub fn record_lineage(&self, id: &str, parent: Option<&str>) {
        let Some(parent) = parent else {
            return;
        };
        if let Err(e) = self.try_record(id, parent) {
            error!(id, parent, error = %e, "failed to record lineage");
        }
    }

    fn try_record(&self, id: &str, parent: &str) -> Result<()> {
        let mut ancestry = self.load(parent)?.map(|r| r.ancestry).unwrap_or_default();
        ancestry.push(parent.to_string());

        let record = LineageRecord {
            ancestry,
            timestamp: unix_millis(),
        };
        self.store.put_lineage(id, &serde_json::to_string(&record)?)?;
        debug!(id, parent, depth = record.ancestry.len(), "recorded lineage");
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<LineageRecord>> {
        match self.store.get_lineage(id)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Ancestry of `id`, oldest first. Empty when unknown or unreadable.
    pub fn ancestry(&self, id: &str) -> Vec<String> {
        match self.load(id) {
            Ok(record) => record.map(|r| r.ancestry).unwrap_or_default(),
            Err(e) => {
                error!(id, error = %e, "failed to read lineage");
                Vec::new()
            }
        }
    }
}
