//! Persistence contracts.
//!
//! The core never names a concrete backend. The node picks one at startup
//! and hands it in as `Arc<dyn Store>` and `Arc<dyn CommitJournal>`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::candidate::Candidate;
use crate::error::{Error, Result};

/// Saved state of one peer's admission token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateBucketState {
    pub tokens: f64,
    /// Wall-clock unix millis of the last refill
    pub last_refill_millis: i64,
}

/// Keyed record store: `id → JSON`.
pub trait Store: Send + Sync {
    /// Insert or replace the value for `id`.
    fn put(&self, id: &str, value: &str) -> Result<()>;

    /// Value for `id`, if present.
    fn get(&self, id: &str) -> Result<Option<String>>;

    /// Every stored record, ordered by id.
    fn get_all(&self) -> Result<BTreeMap<String, String>>;

    /// Remove `id`. Removing a missing id is not an error.
    fn delete(&self, id: &str) -> Result<()>;

    /// Whether `id` is present.
    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.get(id)?.is_some())
    }

    /// Insert or replace the lineage entry for `id`.
    fn put_lineage(&self, id: &str, value: &str) -> Result<()>;

    /// Lineage entry for `id`, if present.
    fn get_lineage(&self, id: &str) -> Result<Option<String>>;

    /// Insert or replace the saved token bucket for `peer`.
    fn save_rate_bucket(&self, peer: &str, state: &RateBucketState) -> Result<()>;

    /// Saved token bucket for `peer`, if any.
    fn load_rate_bucket(&self, peer: &str) -> Result<Option<RateBucketState>>;

    /// Flush and release the backend. Later calls may fail.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Durable commit log plus the latest committed snapshot.
pub trait CommitJournal: Send + Sync {
    /// Append one log line.
    fn append_log(&self, entry: &str) -> Result<()>;

    /// Every log line, oldest first.
    fn read_log(&self) -> Result<Vec<String>>;

    /// Replace the latest snapshot.
    fn save_snapshot(&self, candidate: &Candidate) -> Result<()>;

    /// The latest snapshot, if any commit has happened.
    fn load_snapshot(&self) -> Result<Option<Candidate>>;
}

/// In-memory backend for tests and single-process clusters.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, String>>,
    lineage: RwLock<BTreeMap<String, String>>,
    rate_buckets: RwLock<BTreeMap<String, RateBucketState>>,
    log: RwLock<Vec<String>>,
    snapshot: RwLock<Option<Candidate>>,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    fn put(&self, id: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        self.records.write().insert(id.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self.records.read().get(id).cloned())
    }

    fn get_all(&self) -> Result<BTreeMap<String, String>> {
        self.ensure_open()?;
        Ok(self.records.read().clone())
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        self.records.write().remove(id);
        Ok(())
    }

    fn put_lineage(&self, id: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        self.lineage.write().insert(id.to_string(), value.to_string());
        Ok(())
    }

    fn get_lineage(&self, id: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self.lineage.read().get(id).cloned())
    }

    fn save_rate_bucket(&self, peer: &str, state: &RateBucketState) -> Result<()> {
        self.ensure_open()?;
        self.rate_buckets.write().insert(peer.to_string(), *state);
        Ok(())
    }

    fn load_rate_bucket(&self, peer: &str) -> Result<Option<RateBucketState>> {
        self.ensure_open()?;
        Ok(self.rate_buckets.read().get(peer).copied())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl CommitJournal for MemoryStore {
    fn append_log(&self, entry: &str) -> Result<()> {
        self.ensure_open()?;
        self.log.write().push(entry.to_string());
        Ok(())
    }

    fn read_log(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self.log.read().clone())
    }

    fn save_snapshot(&self, candidate: &Candidate) -> Result<()> {
        self.ensure_open()?;
        *self.snapshot.write() = Some(candidate.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Candidate>> {
        self.ensure_open()?;
        Ok(self.snapshot.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = MemoryStore::new();
        store.put("a", "{}").unwrap();
        assert!(store.exists("a").unwrap());
        assert_eq!(store.get("a").unwrap().as_deref(), Some("{}"));

        store.delete("a").unwrap();
        assert!(!store.exists("a").unwrap());
        store.delete("a").unwrap();
    }

    #[test]
    fn get_all_is_ordered() {
        let store = MemoryStore::new();
        store.put("b", "2").unwrap();
        store.put("a", "1").unwrap();
        let keys: Vec<_> = store.get_all().unwrap().into_keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn lineage_is_separate_from_records() {
        let store = MemoryStore::new();
        store.put_lineage("a", "[]").unwrap();
        assert!(store.get("a").unwrap().is_none());
        assert_eq!(store.get_lineage("a").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn journal_keeps_order_and_latest_snapshot() {
        let store = MemoryStore::new();
        store.append_log("one").unwrap();
        store.append_log("two").unwrap();
        store.save_snapshot(&Candidate::new("a", vec![1.0], 1.0)).unwrap();
        store.save_snapshot(&Candidate::new("b", vec![1.0], 2.0)).unwrap();

        assert_eq!(store.read_log().unwrap(), vec!["one", "two"]);
        assert_eq!(store.load_snapshot().unwrap().unwrap().id, "b");
    }

    #[test]
    fn rate_buckets_are_keyed_by_peer() {
        let store = MemoryStore::new();
        let state = RateBucketState {
            tokens: 3.5,
            last_refill_millis: 1_700_000_000_000,
        };
        store.save_rate_bucket("10.0.0.1", &state).unwrap();

        assert_eq!(store.load_rate_bucket("10.0.0.1").unwrap(), Some(state));
        assert!(store.load_rate_bucket("10.0.0.2").unwrap().is_none());
        assert!(store.get("10.0.0.1").unwrap().is_none());
    }

    #[test]
    fn closed_store_refuses_writes() {
        let store = MemoryStore::new();
        store.close().unwrap();
        assert!(matches!(store.put("a", "1"), Err(Error::Closed)));
    }
}
