//! Spiron Node - wiring and lifecycle.
//!
//! Architecture:
//! - One store shared by the engine journal, lineage and replicated records
//! - RPC server for broadcast, commit and sync
//! - Gossip scheduler and commit loop as background tasks
//! - Every outbound call goes through per-peer breakers and retry

use spiron_admission::{AdmissionPipeline, ValidationError};
use spiron_core::{Candidate, DominanceEngine, LineageTracker, MetricsSink, PrometheusMetrics, Store};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::NodeConfig;
use crate::error::Result;
use crate::gossip::GossipScheduler;
use crate::outbound::{FanOut, Outbound};
use crate::replica::ReplicaStore;
use crate::resilience::ResilientClient;
use crate::server::{RpcHandler, RpcServer};
use crate::signer::NodeSigner;
use crate::storage::{open_storage, OpenedStorage};
use crate::transport::{PeerTransport, TcpTransport};

/// How often rate buckets are saved and admission state is swept.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

/// A Spiron node instance.
pub struct SpironNode {
    config: NodeConfig,
    node_id: String,
    store: Arc<dyn Store>,
    engine: Arc<DominanceEngine>,
    admission: Arc<AdmissionPipeline>,
    replicas: Arc<ReplicaStore>,
    handler: Arc<RpcHandler>,
    client: Arc<ResilientClient>,
    outbound: Arc<Outbound>,
    gossip: GossipScheduler,
    metrics: Arc<PrometheusMetrics>,
}

impl SpironNode {
    /// Create a node that talks to its peers over TCP.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let transport = Arc::new(TcpTransport::new(config.rpc_timeout));
        Self::with_transport(config, transport)
    }

    /// Create a node over any peer transport.
    pub fn with_transport(config: NodeConfig, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        let OpenedStorage {
            store,
            journal,
            node_key,
        } = open_storage(config.storage, &config.data_dir)?;

        let signer = Arc::new(NodeSigner::new(node_key));
        let node_id = signer.node_id().to_string();

        let metrics = Arc::new(PrometheusMetrics::new()?);
        let sink: Arc<dyn MetricsSink> = metrics.clone();

        let client = Arc::new(ResilientClient::new(transport, config.breaker.clone(), Arc::clone(&sink)));
        let outbound = Arc::new(Outbound::new(
            Arc::clone(&client),
            config.peers.clone(),
            config.rpc_workers,
            config.retry.clone(),
            signer,
            config.signing_mode,
        ));

        let engine = Arc::new(
            DominanceEngine::new(config.engine.clone(), Arc::clone(&sink))
                .with_journal(journal)
                .with_lineage(LineageTracker::new(Arc::clone(&store)))
                .with_propagator(outbound.clone()),
        );
        let replayed = engine.replay_log();

        let admission = Arc::new(
            AdmissionPipeline::from_config(&config.admission, Arc::clone(&sink))?.with_rate_store(Arc::clone(&store)),
        );
        let replicas = Arc::new(ReplicaStore::new(
            node_id.clone(),
            Arc::clone(&store),
            config.finality_threshold,
            Arc::clone(&sink),
        ));
        let handler = Arc::new(RpcHandler::new(
            Arc::clone(&engine),
            Arc::clone(&admission),
            Arc::clone(&replicas),
            config.signing_mode,
            Arc::clone(&sink),
        ));
        let gossip = GossipScheduler::new(
            Arc::clone(&replicas),
            Arc::clone(&client),
            config.peers.clone(),
            config.gossip.clone(),
            sink,
        );

        info!(
            node_id = %node_id,
            storage = %config.storage,
            peers = config.peers.len(),
            signing = %config.signing_mode,
            replayed_commits = replayed,
            "node created"
        );

        Ok(Self {
            config,
            node_id,
            store,
            engine,
            admission,
            replicas,
            handler,
            client,
            outbound,
            gossip,
            metrics,
        })
    }

    /// `b3b3/...` identity, also this node's replica id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<DominanceEngine> {
        &self.engine
    }

    pub fn admission(&self) -> &Arc<AdmissionPipeline> {
        &self.admission
    }

    pub fn replicas(&self) -> &Arc<ReplicaStore> {
        &self.replicas
    }

    pub fn handler(&self) -> &Arc<RpcHandler> {
        &self.handler
    }

    pub fn client(&self) -> &Arc<ResilientClient> {
        &self.client
    }

    pub fn gossip(&self) -> &GossipScheduler {
        &self.gossip
    }

    /// Per-node registry; [`PrometheusMetrics::encode`] renders it for scraping.
    pub fn metrics(&self) -> &Arc<PrometheusMetrics> {
        &self.metrics
    }

    /// Accept a locally originated candidate and offer it to every peer.
    ///
    /// Local submissions skip the allowlist, rate limit and dedup, but not
    /// validation.
    pub fn submit(&self, candidate: Candidate) -> std::result::Result<FanOut, ValidationError> {
        self.admission
            .validator()
            .validate(&candidate.id, &candidate.vector, candidate.energy)?;

        let stored = self.engine.ingest(candidate.clone());
        self.replicas.record_local_update(&stored);
        debug!(id = %candidate.id, "local candidate submitted");
        Ok(self.outbound.broadcast(&candidate))
    }

    /// Run until `shutdown` resolves, then stop every background task.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let server = RpcServer::bind(self.config.listen_addr, Arc::clone(&self.handler))
            .await?
            .with_max_frame_bytes(self.config.rpc_max_frame_bytes)
            .with_idle_timeout(self.config.rpc_timeout);
        info!("  RPC: {}", server.local_addr()?);
        info!("  Data: {:?} ({})", self.config.data_dir, self.config.storage);

        let (stop_tx, stop_rx) = watch::channel(false);
        let server_task = tokio::spawn(server.run(stop_rx.clone()));
        let commit_task = spawn_commit_loop(Arc::clone(&self.engine), self.config.commit_interval, stop_rx.clone());
        let housekeeping_task = spawn_housekeeping(Arc::clone(&self.admission), HOUSEKEEPING_INTERVAL, stop_rx);
        self.gossip.start();

        shutdown.await;
        info!("shutting down");

        let _ = stop_tx.send(true);
        self.gossip.stop().await;
        if let Err(e) = commit_task.await {
            error!(error = %e, "commit loop panicked");
        }
        if let Err(e) = housekeeping_task.await {
            error!(error = %e, "housekeeping panicked");
        }
        match server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "rpc server failed"),
            Err(e) => error!(error = %e, "rpc server panicked"),
        }

        let admission = Arc::clone(&self.admission);
        match tokio::task::spawn_blocking(move || admission.persist_rate_limits()).await {
            Ok(saved) => debug!(saved, "final rate bucket flush"),
            Err(e) => error!(error = %e, "final rate bucket flush panicked"),
        }

        if let Err(e) = self.store.close() {
            error!(error = %e, "failed to close store");
        }
        info!(metrics = ?self.metrics.snapshot(), "node stopped");
        Ok(())
    }
}

/// Commit the dominant candidate every `interval` until `stop` flips.
fn spawn_commit_loop(
    engine: Arc<DominanceEngine>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(committed) = engine.check_and_commit() {
                        debug!(id = %committed.id, "commit loop committed");
                    }
                }
                _ = stop.changed() => break,
            }
        }
    })
}

/// Save rate buckets, then sweep expired dedup ids and idle buckets, every
/// `interval`.
fn spawn_housekeeping(
    admission: Arc<AdmissionPipeline>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let admission = Arc::clone(&admission);
                    let swept = tokio::task::spawn_blocking(move || {
                        let saved = admission.persist_rate_limits();
                        (saved, admission.sweep())
                    })
                    .await;
                    match swept {
                        Ok((saved, removed)) => debug!(saved, removed, "admission housekeeping"),
                        Err(e) => error!(error = %e, "admission housekeeping panicked"),
                    }
                }
                _ = stop.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageBackend;
    use crate::transport::TransportError;
    use crate::wire::{Ack, AckStatus, Request, Response};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use spiron_admission::{AdmissionConfig, Rejection};

    #[derive(Default)]
    struct Sink {
        seen: Mutex<Vec<Request>>,
    }

    #[async_trait]
    impl PeerTransport for Sink {
        async fn call(&self, _peer: &str, request: Request) -> std::result::Result<Response, TransportError> {
            self.seen.lock().push(request);
            Ok(Response::Ack(Ack::new(AckStatus::Ok)))
        }
    }

    fn node(transport: Arc<Sink>) -> SpironNode {
        let mut config = NodeConfig::default()
            .with_storage(StorageBackend::Memory)
            .with_peers(vec!["peer-1".into(), "peer-2".into()]);
        config.admission.validation.dimensions = 2;
        SpironNode::with_transport(config, transport).unwrap()
    }

    #[test]
    fn node_id_is_derived_from_key() {
        let n = node(Arc::new(Sink::default()));
        assert!(n.node_id().starts_with("b3b3/"));
        assert_eq!(n.replicas().replica_id(), n.node_id());
    }

    #[tokio::test]
    async fn submit_broadcasts_to_all_peers() {
        let transport = Arc::new(Sink::default());
        let n = node(transport.clone());

        let results = n.submit(Candidate::new("x", vec![1.0, 0.0], 2.0)).unwrap().join().await;
        assert_eq!(results.len(), 2);
        assert_eq!(transport.seen.lock().len(), 2);
        assert!(n.engine().get("x").is_some());
        assert_eq!(n.replicas().get("x").unwrap().approvals.get(n.node_id()), 1);
    }

    #[test]
    fn submit_still_validates() {
        let n = node(Arc::new(Sink::default()));
        assert!(n.submit(Candidate::new("x", vec![1.0], 2.0)).is_err());
        assert!(n.engine().is_empty());
    }

    #[tokio::test]
    async fn rate_budget_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = || {
            let mut c = NodeConfig::default()
                .with_data_dir(dir.path())
                .with_listen_addr("127.0.0.1:0".parse().unwrap())
                .with_admission(AdmissionConfig::default().with_rate_limit(1));
            c.admission.validation.dimensions = 2;
            c
        };
        let candidate = |id: &str| Candidate::new(id, vec![1.0, 0.0], 1.0);

        let first = SpironNode::with_transport(config(), Arc::new(Sink::default())).unwrap();
        assert!(first.admission().admit("10.0.0.9", &candidate("a")).is_ok());
        assert!(first.admission().admit("10.0.0.9", &candidate("b")).is_ok());
        assert_eq!(first.admission().admit("10.0.0.9", &candidate("c")), Err(Rejection::RateLimit));
        // Shutdown flushes the buckets before closing the store
        first.run_until(async {}).await.unwrap();

        let second = SpironNode::with_transport(config(), Arc::new(Sink::default())).unwrap();
        assert_eq!(second.admission().admit("10.0.0.9", &candidate("d")), Err(Rejection::RateLimit));
        assert!(second.admission().admit("10.0.0.10", &candidate("e")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn commit_loop_sends_signed_commits() {
        let transport = Arc::new(Sink::default());
        let n = node(transport.clone());
        n.engine().ingest(Candidate::new("x", vec![1.0, 0.0], 2.0));

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = spawn_commit_loop(Arc::clone(n.engine()), Duration::from_millis(300), stop_rx);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        // Let the fan-out tasks finish
        tokio::time::sleep(Duration::from_millis(10)).await;
        let seen = transport.seen.lock();
        // One commit, to each of two peers; the unchanged dominant is not resent
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|r| matches!(r, Request::Commit(c) if c.sig_scheme == "ed25519")));
    }
}
