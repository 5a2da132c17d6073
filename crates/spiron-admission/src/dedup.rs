//! Duplicate detection by message id.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// How often expired entries are swept during checks.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Rejects a message id seen again inside the expiry window.
///
/// A sighting after the window has lapsed counts as new and restarts the
/// window. Expired ids are swept at most once per sweep interval, from
/// inside [`check`](Self::check), so the table stays bounded without a
/// background task.
#[derive(Debug)]
pub struct DuplicateDetector {
    expiry: Duration,
    sweep_interval: Duration,
    seen: DashMap<String, Instant>,
    last_sweep: Mutex<Option<Instant>>,
}

impl DuplicateDetector {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            seen: DashMap::new(),
            last_sweep: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// True on a first sighting, false for a duplicate.
    pub fn check(&self, message_id: &str) -> bool {
        self.check_at(message_id, Instant::now())
    }

    /// [`check`](Self::check) at an explicit instant.
    pub fn check_at(&self, message_id: &str, now: Instant) -> bool {
        self.maybe_sweep(now);

        match self.seen.entry(message_id.to_string()) {
            Entry::Occupied(mut seen) => {
                if now.saturating_duration_since(*seen.get()) < self.expiry {
                    return false;
                }
                seen.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    fn maybe_sweep(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock();
            match *last {
                Some(at) if now.saturating_duration_since(at) < self.sweep_interval => return,
                Some(_) => *last = Some(now),
                None => {
                    *last = Some(now);
                    return;
                }
            }
        }
        self.sweep_at(now);
    }

    /// Remove every id whose window has lapsed. Returns how many went.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, seen| now.saturating_duration_since(*seen) < self.expiry);
        let removed = before.saturating_sub(self.seen.len());
        if removed > 0 {
            debug!(removed, remaining = self.seen.len(), "swept expired message ids");
        }
        removed
    }

    /// Number of ids currently remembered.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
