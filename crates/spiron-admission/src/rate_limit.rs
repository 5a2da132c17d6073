//! Per-peer token buckets.
//!
//! Buckets live in memory. With a store attached they are also saved under
//! the peer's name and restored the first time that peer is seen again, so a
//! restart does not hand every peer a fresh budget.

use dashmap::DashMap;
use spiron_core::{unix_millis, RateBucketState, Store};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter keyed by peer identity.
///
/// Each bucket holds up to twice the per-second rate and refills
/// continuously at the rate. A fresh peer starts with a full bucket.
pub struct RateLimiter {
    rate_per_second: f64,
    capacity: f64,
    buckets: DashMap<String, Bucket>,
    store: Option<Arc<dyn Store>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate_per_second", &self.rate_per_second)
            .field("capacity", &self.capacity)
            .field("tracked_peers", &self.buckets.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(rate_per_second: u32) -> Self {
        let rate = f64::from(rate_per_second);
        Self {
            rate_per_second: rate,
            capacity: rate * 2.0,
            buckets: DashMap::new(),
            store: None,
        }
    }

    /// Save and restore buckets through `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Take one token for `peer`, if available.
    pub fn allow(&self, peer: &str) -> bool {
        self.allow_at(peer, Instant::now())
    }

    /// [`allow`](Self::allow) at an explicit instant.
    pub fn allow_at(&self, peer: &str, now: Instant) -> bool {
        let capacity = self.capacity;
        // Store reads happen outside the map's shard lock
        let initial = (!self.buckets.contains_key(peer)).then(|| self.initial_bucket(peer, now));
        let mut bucket = self
            .buckets
            .entry(peer.to_string())
            .or_insert_with(|| {
                initial.unwrap_or(Bucket {
                    tokens: capacity,
                    last_refill: now,
                })
            });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if !elapsed.is_zero() {
            bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate_per_second).min(capacity);
            bucket.last_refill = now;
        }

        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }

    /// Bucket for a peer not currently tracked: the saved one refilled for
    /// the wall-clock time since it was saved, or a full one.
    fn initial_bucket(&self, peer: &str, now: Instant) -> Bucket {
        let full = Bucket {
            tokens: self.capacity,
            last_refill: now,
        };
        let Some(store) = &self.store else {
            return full;
        };
        match store.load_rate_bucket(peer) {
            Ok(Some(saved)) => {
                let idle_ms = unix_millis().saturating_sub(saved.last_refill_millis).max(0);
                let refilled = Duration::from_millis(idle_ms as u64).as_secs_f64() * self.rate_per_second;
                let tokens = (saved.tokens + refilled).clamp(0.0, self.capacity);
                debug!(peer, tokens, "restored rate bucket");
                Bucket {
                    tokens,
                    last_refill: now,
                }
            }
            Ok(None) => full,
            Err(e) => {
                warn!(peer, error = %e, "failed to restore rate bucket");
                full
            }
        }
    }

    /// Save every tracked bucket to the attached store.
    ///
    /// Returns how many were written. Without a store this does nothing.
    pub fn persist(&self) -> usize {
        self.persist_at(Instant::now())
    }

    /// [`persist`](Self::persist) with `now` anchoring bucket ages.
    pub fn persist_at(&self, now: Instant) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let wall = unix_millis();
        let buckets: Vec<(String, Bucket)> = self
            .buckets
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let mut saved = 0;
        for (peer, bucket) in buckets {
            let age = now.saturating_duration_since(bucket.last_refill).as_millis() as i64;
            let state = RateBucketState {
                tokens: bucket.tokens,
                last_refill_millis: wall - age,
            };
            match store.save_rate_bucket(&peer, &state) {
                Ok(()) => saved += 1,
                Err(e) => warn!(peer = %peer, error = %e, "failed to persist rate bucket"),
            }
        }
        if saved > 0 {
            debug!(saved, "persisted rate buckets");
        }
        saved
    }

    /// Time for an empty bucket to fill. `None` when the rate is zero.
    pub fn refill_time(&self) -> Option<Duration> {
        (self.rate_per_second > 0.0).then(|| Duration::from_secs_f64(self.capacity / self.rate_per_second))
    }

    /// Tokens currently available to `peer`, without refilling.
    pub fn available(&self, peer: &str) -> Option<f64> {
        self.buckets.get(peer).map(|b| b.tokens)
    }

    /// Drop buckets untouched for at least `idle`.
    ///
    /// A dropped peer comes back with a full bucket, which is what it would
    /// have refilled to anyway once `idle` covers the refill time.
    pub fn sweep_idle_at(&self, now: Instant, idle: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last_refill) < idle);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, "swept idle rate buckets");
        }
        removed
    }

    /// Number of tracked peers.
    pub fn tracked_peers(&self) -> usize {
        self.buckets.len()
    }
}
