//! Full-state gossip with one random peer per round.
//!
//! Each round sends the whole local record map to a peer chosen uniformly at
//! random. The peer merges it, answers with its own full map, and the
//! initiator merges that in turn. Repeated random rounds spread an update to
//! every node in an expected O(log N) rounds.
//!
//! A failed round is logged and dropped. The next tick is the retry.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use spiron_core::{MetricEvent, MetricsSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::replica::ReplicaStore;
use crate::resilience::{ResilientClient, RetryPolicy};
use crate::wire::{Request, Response, SyncRequest, SyncResponse};

/// Gossip timing.
#[derive(Debug, Clone, PartialEq)]
pub struct GossipConfig {
    /// Time between rounds
    pub interval: Duration,
    /// How long `stop` waits for an in-flight round before aborting it
    pub shutdown_grace: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

impl GossipConfig {
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Receiving side of a sync.
pub struct GossipService {
    replicas: Arc<ReplicaStore>,
}

impl GossipService {
    pub fn new(replicas: Arc<ReplicaStore>) -> Self {
        Self { replicas }
    }

    /// Merge the sender's records, then answer with ours.
    pub fn handle_sync(&self, request: SyncRequest) -> SyncResponse {
        let received = request.records.len();
        let changed = self.replicas.merge_remote(request.records);
        debug!(sender = %request.sender_id, received, changed = changed.len(), "handled sync");
        SyncResponse {
            records: self.replicas.records(),
        }
    }
}

/// What one round did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// No peers configured
    NoPeers,
    /// Exchanged state with `peer`; `changed` local ids were updated
    Completed { peer: String, changed: usize },
    /// The exchange with `peer` failed
    Failed { peer: String },
}

struct RunningTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Everything a round needs, shared with the periodic task.
struct RoundDriver {
    replicas: Arc<ReplicaStore>,
    client: Arc<ResilientClient>,
    peers: Vec<String>,
    metrics: Arc<dyn MetricsSink>,
}

impl RoundDriver {
    async fn run(&self) -> RoundOutcome {
        let Some(peer) = self.peers.choose(&mut rand::thread_rng()).cloned() else {
            return RoundOutcome::NoPeers;
        };

        let started = Instant::now();
        let request = Request::Sync(SyncRequest {
            sender_id: self.replicas.replica_id().to_string(),
            records: self.replicas.records(),
        });

        let outcome = match self.client.call(&peer, request, &RetryPolicy::none()).await {
            Ok(Response::Sync(SyncResponse { records })) => {
                let changed = self.replicas.merge_remote(records).len();
                debug!(peer = %peer, changed, "gossip round complete");
                RoundOutcome::Completed { peer, changed }
            }
            Ok(other) => {
                warn!(peer = %peer, response = ?other, "unexpected gossip reply");
                RoundOutcome::Failed { peer }
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "gossip round failed");
                RoundOutcome::Failed { peer }
            }
        };

        let event = match &outcome {
            RoundOutcome::Completed { .. } => MetricEvent::GossipRound,
            _ => MetricEvent::GossipFailure,
        };
        self.metrics.record(event);
        self.metrics.observe_latency(event, started.elapsed());
        outcome
    }
}

/// Drives gossip rounds on a fixed interval.
///
/// Rounds run one at a time on a single task. [`stop`](Self::stop) signals
/// that task, waits at most the shutdown grace, then aborts it. Dropping the
/// scheduler aborts the task.
pub struct GossipScheduler {
    driver: Arc<RoundDriver>,
    config: GossipConfig,
    task: Mutex<Option<RunningTask>>,
}

impl GossipScheduler {
    pub fn new(
        replicas: Arc<ReplicaStore>,
        client: Arc<ResilientClient>,
        peers: Vec<String>,
        config: GossipConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            driver: Arc::new(RoundDriver {
                replicas,
                client,
                peers,
                metrics,
            }),
            config,
            task: Mutex::new(None),
        }
    }

    /// Start the periodic task. Starting twice is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let driver = Arc::clone(&self.driver);
        let interval = self.config.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        driver.run().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("gossip task exited");
        });

        info!(?interval, peers = self.driver.peers.len(), "gossip scheduler started");
        *task = Some(RunningTask { shutdown, handle });
    }

    /// Stop the periodic task within the shutdown grace.
    pub async fn stop(&self) {
        let Some(RunningTask { shutdown, mut handle }) = self.task.lock().take() else {
            return;
        };
        // The receiver is gone if the task already ended
        let _ = shutdown.send(true);

        if tokio::time::timeout(self.config.shutdown_grace, &mut handle).await.is_err() {
            warn!(grace = ?self.config.shutdown_grace, "gossip round still running, aborting");
            handle.abort();
        }
        info!("gossip scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Run one round now.
    pub async fn run_round(&self) -> RoundOutcome {
        self.driver.run().await
    }
}

impl Drop for GossipScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.handle.abort();
        }
    }
}
