//! Persistent storage using RocksDB, plus the backend factory.

use ed25519_dalek::SigningKey;
use rocksdb::{Direction, IteratorMode, Options, DB};
use spiron_core::{Candidate, CommitJournal, MemoryStore, RateBucketState, Store};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::{Error, Result};

const RECORD_PREFIX: &[u8] = b"record:";
const LINEAGE_PREFIX: &[u8] = b"lineage:";
const RATE_LIMIT_PREFIX: &[u8] = b"ratelimit:";
const LOG_PREFIX: &[u8] = b"log:";
const SNAPSHOT_KEY: &[u8] = b"snapshot:latest";
const NODE_KEY: &[u8] = b"node:signing_key";

/// Which store backs a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Embedded RocksDB under the data directory
    RocksDb,
    /// Process memory, lost on exit
    Memory,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RocksDb => write!(f, "rocksdb"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rocksdb" => Ok(Self::RocksDb),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown storage backend {other:?} (expected rocksdb or memory)")),
        }
    }
}

/// An opened backend, seen as both record store and commit journal, and the
/// node's signing key.
pub struct OpenedStorage {
    pub store: Arc<dyn Store>,
    pub journal: Arc<dyn CommitJournal>,
    pub node_key: SigningKey,
}

/// Open the configured backend.
///
/// RocksDB keeps the signing key alongside the data so the node id survives
/// restarts. The memory backend gets a fresh key every time.
pub fn open_storage(kind: StorageBackend, data_dir: &Path) -> Result<OpenedStorage> {
    match kind {
        StorageBackend::RocksDb => {
            std::fs::create_dir_all(data_dir)?;
            let store = Arc::new(RocksStore::open(data_dir)?);
            let node_key = store.get_or_create_node_key()?;
            info!(path = ?data_dir, "opened rocksdb store");
            Ok(OpenedStorage {
                store: store.clone(),
                journal: store,
                node_key,
            })
        }
        StorageBackend::Memory => {
            info!("using in-memory store");
            let store = Arc::new(MemoryStore::new());
            Ok(OpenedStorage {
                store: store.clone(),
                journal: store,
                node_key: SigningKey::generate(&mut rand::thread_rng()),
            })
        }
    }
}

/// RocksDB store for replicated records, lineage and the commit journal.
pub struct RocksStore {
    db: DB,
    next_log_seq: AtomicU64,
}

impl RocksStore {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        let next_log_seq = AtomicU64::new(last_log_seq(&db)?.map_or(0, |s| s + 1));
        Ok(Self { db, next_log_seq })
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.prefix_iterator(prefix) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key[prefix.len()..].to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn get_string(&self, key: &[u8]) -> Result<Option<String>> {
        match self.db.get(key)? {
            Some(data) => String::from_utf8(data)
                .map(Some)
                .map_err(|e| Error::Storage(format!("non-utf8 value: {e}"))),
            None => Ok(None),
        }
    }

    // --- Node Identity ---

    /// Get or create the node's signing key (persistent identity).
    pub fn get_or_create_node_key(&self) -> Result<SigningKey> {
        if let Some(data) = self.db.get(NODE_KEY)? {
            let bytes: [u8; 32] = data
                .as_slice()
                .try_into()
                .map_err(|_| Error::Storage("Invalid stored key".into()))?;
            Ok(SigningKey::from_bytes(&bytes))
        } else {
            let signing_key = SigningKey::generate(&mut rand::thread_rng());
            self.db.put(NODE_KEY, signing_key.as_bytes())?;
            Ok(signing_key)
        }
    }
}

fn prefixed(prefix: &[u8], id: &str) -> Vec<u8> {
    [prefix, id.as_bytes()].concat()
}

fn log_key(seq: u64) -> Vec<u8> {
    // Zero-padded so byte order is numeric order
    prefixed(LOG_PREFIX, &format!("{seq:020}"))
}

fn last_log_seq(db: &DB) -> Result<Option<u64>> {
    let upper = prefixed(LOG_PREFIX, &"9".repeat(20));
    let mut iter = db.iterator(IteratorMode::From(&upper, Direction::Reverse));
    match iter.next() {
        Some(item) => {
            let (key, _) = item?;
            if !key.starts_with(LOG_PREFIX) {
                return Ok(None);
            }
            let seq = std::str::from_utf8(&key[LOG_PREFIX.len()..])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Storage("corrupt commit log key".into()))?;
            Ok(Some(seq))
        }
        None => Ok(None),
    }
}

impl Store for RocksStore {
    fn put(&self, id: &str, value: &str) -> spiron_core::Result<()> {
        self.db.put(prefixed(RECORD_PREFIX, id), value).map_err(Error::from)?;
        Ok(())
    }

    fn get(&self, id: &str) -> spiron_core::Result<Option<String>> {
        Ok(self.get_string(&prefixed(RECORD_PREFIX, id))?)
    }

    fn get_all(&self) -> spiron_core::Result<BTreeMap<String, String>> {
        let mut all = BTreeMap::new();
        for (id, value) in self.scan(RECORD_PREFIX)? {
            let id = String::from_utf8(id).map_err(|e| Error::Storage(format!("non-utf8 id: {e}")))?;
            let value = String::from_utf8(value).map_err(|e| Error::Storage(format!("non-utf8 value: {e}")))?;
            all.insert(id, value);
        }
        Ok(all)
    }

    fn delete(&self, id: &str) -> spiron_core::Result<()> {
        self.db.delete(prefixed(RECORD_PREFIX, id)).map_err(Error::from)?;
        Ok(())
    }

    fn put_lineage(&self, id: &str, value: &str) -> spiron_core::Result<()> {
        self.db.put(prefixed(LINEAGE_PREFIX, id), value).map_err(Error::from)?;
        Ok(())
    }

    fn get_lineage(&self, id: &str) -> spiron_core::Result<Option<String>> {
        Ok(self.get_string(&prefixed(LINEAGE_PREFIX, id))?)
    }

    fn save_rate_bucket(&self, peer: &str, state: &RateBucketState) -> spiron_core::Result<()> {
        let value = serde_json::to_vec(state)?;
        self.db.put(prefixed(RATE_LIMIT_PREFIX, peer), value).map_err(Error::from)?;
        Ok(())
    }

    fn load_rate_bucket(&self, peer: &str) -> spiron_core::Result<Option<RateBucketState>> {
        match self.db.get(prefixed(RATE_LIMIT_PREFIX, peer)).map_err(Error::from)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn close(&self) -> spiron_core::Result<()> {
        self.db.flush().map_err(Error::from)?;
        Ok(())
    }
}

impl CommitJournal for RocksStore {
    fn append_log(&self, entry: &str) -> spiron_core::Result<()> {
        let seq = self.next_log_seq.fetch_add(1, Ordering::SeqCst);
        self.db.put(log_key(seq), entry).map_err(Error::from)?;
        Ok(())
    }

    fn read_log(&self) -> spiron_core::Result<Vec<String>> {
        let mut lines = Vec::new();
        for (_, value) in self.scan(LOG_PREFIX)? {
            lines.push(String::from_utf8(value).map_err(|e| Error::Storage(format!("non-utf8 log entry: {e}")))?);
        }
        Ok(lines)
    }

    fn save_snapshot(&self, candidate: &Candidate) -> spiron_core::Result<()> {
        let value = serde_json::to_vec(candidate)?;
        self.db.put(SNAPSHOT_KEY, value).map_err(Error::from)?;
        Ok(())
    }

    fn load_snapshot(&self) -> spiron_core::Result<Option<Candidate>> {
        match self.db.get(SNAPSHOT_KEY).map_err(Error::from)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }
}
