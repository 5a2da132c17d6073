//! Retry with backoff and per-peer circuit breakers.
//!
//! Retry runs inside one logical call; the breaker decides whether that call
//! is attempted at all. A call that exhausts its retries counts as one
//! breaker failure.

use dashmap::DashMap;
use parking_lot::Mutex;
use spiron_core::{MetricEvent, MetricsSink};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::transport::{PeerTransport, TransportError};
use crate::wire::{Request, Response};

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A single attempt. Gossip uses this: the next round is the retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }
}

/// When a breaker opens and for how long.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time spent open before a trial call is allowed
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::from_millis(5000),
        }
    }
}

impl BreakerConfig {
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls short-circuit until the cooldown elapses.
    Open,
    /// One trial call is in flight.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker for one destination.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Whether a call may go out now.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open | BreakerState::HalfOpen => {
                // A half-open trial that never reported back is replaced
                // after another cooldown.
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.config.cooldown);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.opened_at = Some(now);
                }
                cooled
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// Count a failed call. Returns true if this failure opened the breaker.
    pub fn record_failure_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = inner.state == BreakerState::HalfOpen
            || (inner.state == BreakerState::Closed && inner.consecutive_failures >= self.config.failure_threshold);
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
        }
        trip
    }
}

/// Lazily created breakers, one per destination.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, peer: &str) -> Arc<CircuitBreaker> {
        Arc::clone(
            self.breakers
                .entry(peer.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
                .value(),
        )
    }

    /// Current state for `peer`; unknown peers are closed.
    pub fn state(&self, peer: &str) -> BreakerState {
        self.breakers
            .get(peer)
            .map_or(BreakerState::Closed, |b| b.state())
    }
}

/// Transport wrapped in per-peer breakers and retry.
pub struct ResilientClient {
    transport: Arc<dyn PeerTransport>,
    breakers: BreakerRegistry,
    metrics: Arc<dyn MetricsSink>,
}

impl ResilientClient {
    pub fn new(transport: Arc<dyn PeerTransport>, breaker: BreakerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            transport,
            breakers: BreakerRegistry::new(breaker),
            metrics,
        }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// One logical call to `peer`.
    ///
    /// Transient errors are retried under `policy`; anything else fails at
    /// once. An open breaker fails without touching the network.
    pub async fn call(&self, peer: &str, request: Request, policy: &RetryPolicy) -> Result<Response, TransportError> {
        let breaker = self.breakers.get(peer);
        if !breaker.try_acquire() {
            self.metrics.record(MetricEvent::CircuitOpen);
            debug!(peer, "circuit open, call skipped");
            return Err(TransportError::CircuitOpen(peer.to_string()));
        }

        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.transport.call(peer, request.clone()).await {
                Ok(response) => break Ok(response),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = policy.delay_for(attempt);
                    debug!(peer, attempt, ?delay, error = %e, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        match &result {
            Ok(_) => breaker.record_success(),
            Err(e) => {
                self.metrics.record(MetricEvent::OutboundFailure);
                if breaker.record_failure_at(Instant::now()) {
                    warn!(peer, error = %e, "circuit opened");
                } else {
                    info!(peer, attempts = attempt, error = %e, "outbound call failed");
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Ack, AckStatus, BroadcastMessage};
    use async_trait::async_trait;
    use spiron_core::NoopMetrics;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        replies: Mutex<VecDeque<Result<Response, TransportError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Response, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PeerTransport for Scripted {
        async fn call(&self, _peer: &str, _request: Request) -> Result<Response, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Unavailable("script exhausted".into())))
        }
    }

    fn ok() -> Result<Response, TransportError> {
        Ok(Response::Ack(Ack::new(AckStatus::Ok)))
    }

    fn request() -> Request {
        Request::Broadcast(BroadcastMessage {
            id: "a".into(),
            vector: vec![1.0],
            energy: 1.0,
        })
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_millis(10));
        assert_eq!(p.delay_for(2), Duration::from_millis(20));
        assert_eq!(p.delay_for(3), Duration::from_millis(40));
        assert_eq!(p.delay_for(10), Duration::from_millis(500));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn breaker_opens_after_threshold_and_half_opens_after_cooldown() {
        let b = CircuitBreaker::new(BreakerConfig::default().with_failure_threshold(3));
        let t0 = Instant::now();
        assert!(!b.record_failure_at(t0));
        assert!(!b.record_failure_at(t0));
        assert!(b.record_failure_at(t0));
        assert_eq!(b.state(), BreakerState::Open);

        assert!(!b.try_acquire_at(t0 + Duration::from_secs(4)));
        assert!(b.try_acquire_at(t0 + Duration::from_secs(5)));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Only one trial at a time
        assert!(!b.try_acquire_at(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn failed_trial_reopens_and_success_closes() {
        let b = CircuitBreaker::new(BreakerConfig::default().with_failure_threshold(1));
        let t0 = Instant::now();
        b.record_failure_at(t0);
        assert!(b.try_acquire_at(t0 + Duration::from_secs(5)));
        assert!(b.record_failure_at(t0 + Duration::from_secs(5)));
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.try_acquire_at(t0 + Duration::from_secs(9)));

        assert!(b.try_acquire_at(t0 + Duration::from_secs(10)));
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.try_acquire_at(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn success_resets_failure_count() {
        let b = CircuitBreaker::new(BreakerConfig::default().with_failure_threshold(2));
        let t0 = Instant::now();
        b.record_failure_at(t0);
        b.record_success();
        assert!(!b.record_failure_at(t0));
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let transport = Scripted::new(vec![
            Err(TransportError::Unavailable("down".into())),
            Err(TransportError::Io("reset".into())),
            ok(),
        ]);
        let client = ResilientClient::new(transport.clone(), BreakerConfig::default(), Arc::new(NoopMetrics));

        assert!(client.call("p", request(), &RetryPolicy::default()).await.is_ok());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(client.breakers().state("p"), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_fail_at_once() {
        let transport = Scripted::new(vec![Err(TransportError::InvalidArgument("bad".into())), ok()]);
        let client = ResilientClient::new(transport.clone(), BreakerConfig::default(), Arc::new(NoopMetrics));

        let err = client.call("p", request(), &RetryPolicy::default()).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_count_once_against_breaker() {
        let transport = Scripted::new(vec![]);
        let client = ResilientClient::new(
            transport.clone(),
            BreakerConfig::default().with_failure_threshold(2),
            Arc::new(NoopMetrics),
        );

        assert!(client.call("p", request(), &RetryPolicy::default()).await.is_err());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(client.breakers().state("p"), BreakerState::Closed);

        assert!(client.call("p", request(), &RetryPolicy::default()).await.is_err());
        assert_eq!(client.breakers().state("p"), BreakerState::Open);
        // Other peers are unaffected
        assert_eq!(client.breakers().state("q"), BreakerState::Closed);
    }
}
