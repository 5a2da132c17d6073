//! The ordered admission gate.

use spiron_core::{Candidate, MetricEvent, MetricsSink, Store};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::allowlist::PeerAllowlist;
use crate::dedup::DuplicateDetector;
use crate::error::Result;
use crate::rate_limit::RateLimiter;
use crate::validation::{BroadcastValidator, ValidationConfig, ValidationError};

/// Why a broadcast was refused. Each variant has its own caller-visible status.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Allowlist,
    RateLimit,
    Validation(ValidationError),
    Duplicate,
}

impl Rejection {
    /// Status string reported back to the sender.
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Allowlist => "rejected_allowlist",
            Self::RateLimit => "rejected_ratelimit",
            Self::Validation(_) => "rejected_validation",
            Self::Duplicate => "rejected_duplicate",
        }
    }

    fn metric(&self) -> MetricEvent {
        match self {
            Self::Allowlist => MetricEvent::RejectedAllowlist,
            Self::RateLimit => MetricEvent::RejectedRateLimit,
            Self::Validation(_) => MetricEvent::RejectedValidation,
            Self::Duplicate => MetricEvent::RejectedDuplicate,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "{}: {} ({})", self.status(), e, e.code()),
            other => f.write_str(other.status()),
        }
    }
}

/// Knobs for the whole pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    /// Empty means permit all
    pub peer_allowlist: String,
    pub rate_limit_per_second: u32,
    pub duplicate_expiry: Duration,
    pub validation: ValidationConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            peer_allowlist: String::new(),
            rate_limit_per_second: 100,
            duplicate_expiry: Duration::from_millis(60_000),
            validation: ValidationConfig::default(),
        }
    }
}

impl AdmissionConfig {
    #[must_use]
    pub fn with_peer_allowlist(mut self, pattern: impl Into<String>) -> Self {
        self.peer_allowlist = pattern.into();
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit_per_second = per_second;
        self
    }

    #[must_use]
    pub fn with_duplicate_expiry(mut self, expiry: Duration) -> Self {
        self.duplicate_expiry = expiry;
        self
    }

    #[must_use]
    pub fn with_validation(mut self, validation: ValidationConfig) -> Self {
        self.validation = validation;
        self
    }
}

/// Allowlist, rate limit, validation and dedup, applied in that order.
pub struct AdmissionPipeline {
    allowlist: PeerAllowlist,
    rate_limiter: RateLimiter,
    validator: BroadcastValidator,
    dedup: DuplicateDetector,
    metrics: Arc<dyn MetricsSink>,
}

impl AdmissionPipeline {
    pub fn new(
        allowlist: PeerAllowlist,
        rate_limiter: RateLimiter,
        validator: BroadcastValidator,
        dedup: DuplicateDetector,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            allowlist,
            rate_limiter,
            validator,
            dedup,
            metrics,
        }
    }

    /// Build every stage from `config`.
    pub fn from_config(config: &AdmissionConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        Ok(Self::new(
            PeerAllowlist::new(&config.peer_allowlist)?,
            RateLimiter::new(config.rate_limit_per_second),
            BroadcastValidator::new(config.validation.clone())?,
            DuplicateDetector::new(config.duplicate_expiry),
            metrics,
        ))
    }

    /// Run `candidate` from `peer` through every stage.
    pub fn admit(&self, peer: &str, candidate: &Candidate) -> std::result::Result<(), Rejection> {
        self.admit_at(peer, candidate, Instant::now())
    }

    /// [`admit`](Self::admit) at an explicit instant.
    pub fn admit_at(
        &self,
        peer: &str,
        candidate: &Candidate,
        now: Instant,
    ) -> std::result::Result<(), Rejection> {
        let started = Instant::now();
        let outcome = self.evaluate(peer, candidate, now);
        let event = match &outcome {
            Ok(()) => MetricEvent::BroadcastAccepted,
            Err(rejection) => rejection.metric(),
        };
        self.metrics.record(event);
        self.metrics.observe_latency(event, started.elapsed());
        match &outcome {
            Ok(()) => {}
            Err(rejection) => {
                if matches!(rejection, Rejection::Duplicate) {
                    debug!(peer, id = %candidate.id, "duplicate broadcast");
                } else {
                    warn!(peer, id = %candidate.id, reason = %rejection, "broadcast rejected");
                }
            }
        }
        outcome
    }

    fn evaluate(&self, peer: &str, candidate: &Candidate, now: Instant) -> std::result::Result<(), Rejection> {
        if !self.allowlist.permits(peer) {
            return Err(Rejection::Allowlist);
        }
        if !self.rate_limiter.allow_at(peer, now) {
            return Err(Rejection::RateLimit);
        }
        self.validator
            .validate(&candidate.id, &candidate.vector, candidate.energy)
            .map_err(Rejection::Validation)?;
        if !self.dedup.check_at(&candidate.id, now) {
            return Err(Rejection::Duplicate);
        }
        Ok(())
    }

    /// Save and restore rate buckets through `store`.
    #[must_use]
    pub fn with_rate_store(mut self, store: Arc<dyn Store>) -> Self {
        self.rate_limiter = self.rate_limiter.with_store(store);
        self
    }

    /// Save every tracked rate bucket. Returns how many were written.
    pub fn persist_rate_limits(&self) -> usize {
        self.rate_limiter.persist()
    }

    /// Reclaim expired dedup entries and rate buckets that have refilled.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut removed = self.dedup.sweep_at(now);
        if let Some(idle) = self.rate_limiter.refill_time() {
            removed += self.rate_limiter.sweep_idle_at(now, idle);
        }
        removed
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn dedup(&self) -> &DuplicateDetector {
        &self.dedup
    }

    pub fn validator(&self) -> &BroadcastValidator {
        &self.validator
    }
}
