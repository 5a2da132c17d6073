//! Inbound RPC: broadcast, commit and sync handlers behind a TCP listener.

use futures::StreamExt;
use spiron_admission::AdmissionPipeline;
use spiron_core::{DominanceEngine, MetricEvent, MetricsSink};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::gossip::GossipService;
use crate::replica::ReplicaStore;
use crate::signer::{verify_commit, SigningMode};
use crate::wire::{Ack, AckStatus, BroadcastMessage, CommitMessage, Request, Response};

/// Longest request line accepted before the connection is dropped.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// How long a connection may sit without sending a complete line.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport-independent request handling.
pub struct RpcHandler {
    engine: Arc<DominanceEngine>,
    admission: Arc<AdmissionPipeline>,
    replicas: Arc<ReplicaStore>,
    gossip: GossipService,
    signing_mode: SigningMode,
    metrics: Arc<dyn MetricsSink>,
}

impl RpcHandler {
    pub fn new(
        engine: Arc<DominanceEngine>,
        admission: Arc<AdmissionPipeline>,
        replicas: Arc<ReplicaStore>,
        signing_mode: SigningMode,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            engine,
            admission,
            gossip: GossipService::new(Arc::clone(&replicas)),
            replicas,
            signing_mode,
            metrics,
        }
    }

    /// Handle one request from `peer`.
    ///
    /// The handlers write to the store, so they run on the blocking pool.
    pub async fn handle(self: &Arc<Self>, peer: &str, request: Request) -> Response {
        let started = Instant::now();
        let event = match &request {
            Request::Broadcast(_) => MetricEvent::RpcBroadcast,
            Request::Commit(_) => MetricEvent::RpcCommit,
            Request::Sync(_) => MetricEvent::RpcSync,
        };

        let handler = Arc::clone(self);
        let from = peer.to_string();
        let response = match tokio::task::spawn_blocking(move || handler.handle_blocking(&from, request)).await {
            Ok(response) => response,
            Err(e) => {
                error!(peer, error = %e, "request handler panicked");
                Response::Error {
                    message: "internal error".into(),
                }
            }
        };

        self.metrics.record(event);
        self.metrics.observe_latency(event, started.elapsed());
        response
    }

    /// [`handle`](Self::handle) on the calling thread.
    pub fn handle_blocking(&self, peer: &str, request: Request) -> Response {
        match request {
            Request::Broadcast(msg) => Response::Ack(self.handle_broadcast(peer, msg)),
            Request::Commit(msg) => Response::Ack(self.handle_commit(peer, &msg)),
            Request::Sync(req) => Response::Sync(self.gossip.handle_sync(req)),
        }
    }

    /// Admission, then ingest, then the replicated record.
    ///
    /// A failure to persist the record is logged; the broadcast is still
    /// acknowledged.
    pub fn handle_broadcast(&self, peer: &str, msg: BroadcastMessage) -> Ack {
        let candidate = msg.into_candidate();
        if let Err(rejection) = self.admission.admit(peer, &candidate) {
            return Ack::from(&rejection);
        }

        let stored = self.engine.ingest(candidate);
        let record = self.replicas.record_local_update(&stored);
        debug!(peer, id = %stored.id, energy = stored.energy, approvals = record.cumulative(), "broadcast accepted");
        Ack::new(AckStatus::Ok)
    }

    /// Verify, check shape, then persist as committed.
    pub fn handle_commit(&self, peer: &str, msg: &CommitMessage) -> Ack {
        if !verify_commit(self.signing_mode, msg) {
            warn!(peer, id = %msg.id, scheme = %msg.sig_scheme, "commit refused: invalid signature");
            return Ack::new(AckStatus::InvalidSignature);
        }

        let candidate = msg.to_candidate();
        if let Err(e) = self
            .admission
            .validator()
            .validate(&candidate.id, &candidate.vector, candidate.energy)
        {
            error!(peer, id = %candidate.id, code = e.code(), "malformed commit");
            self.metrics.record(MetricEvent::RejectedValidation);
            return Ack::with_detail(AckStatus::Error, format!("{} ({})", e, e.code()));
        }

        info!(peer, id = %candidate.id, energy = candidate.energy, "commit received");
        self.engine.persist_state(candidate);
        Ack::new(AckStatus::Committed)
    }
}

/// TCP front end for an [`RpcHandler`].
///
/// Each connection carries newline-delimited JSON. A line longer than the
/// frame limit, or a connection idle past the timeout, is dropped.
pub struct RpcServer {
    listener: TcpListener,
    handler: Arc<RpcHandler>,
    max_frame_bytes: usize,
    idle_timeout: Duration,
}

impl RpcServer {
    pub async fn bind(addr: SocketAddr, handler: Arc<RpcHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "rpc server listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let handler = Arc::clone(&self.handler);
                        let limits = (self.max_frame_bytes, self.idle_timeout);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(handler, stream, addr, limits).await {
                                debug!(%addr, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept error"),
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("rpc server stopped");
        Ok(())
    }
}

async fn serve_connection(
    handler: Arc<RpcHandler>,
    stream: TcpStream,
    addr: SocketAddr,
    (max_frame_bytes, idle_timeout): (usize, Duration),
) -> Result<()> {
    // The source port changes per connection; the peer is its address
    let peer = addr.ip().to_string();
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame_bytes));

    loop {
        let line = match tokio::time::timeout(idle_timeout, lines.next()).await {
            Err(_) => {
                debug!(%peer, ?idle_timeout, "idle connection closed");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                warn!(%peer, max_frame_bytes, "request line too long, closing connection");
                let reply = Response::Error {
                    message: format!("request exceeds {max_frame_bytes} bytes"),
                };
                let mut out = serde_json::to_string(&reply)?;
                out.push('\n');
                // Best effort: the peer may already be gone
                let _ = writer.write_all(out.as_bytes()).await;
                break;
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => return Err(e.into()),
            Ok(Some(Ok(line))) => line,
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handler.handle(&peer, request).await,
            Err(e) => {
                warn!(%peer, error = %e, "malformed request");
                Response::Error {
                    message: format!("malformed request: {e}"),
                }
            }
        };
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::NodeSigner;
    use crate::transport::{PeerTransport, TcpTransport};
    use crate::wire::SyncRequest;
    use ed25519_dalek::SigningKey;
    use spiron_admission::{AdmissionConfig, ValidationConfig};
    use spiron_core::{Candidate, EngineParams, MemoryStore, NoopMetrics, PrometheusMetrics};
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn handler(mode: SigningMode) -> (Arc<RpcHandler>, Arc<DominanceEngine>, Arc<ReplicaStore>) {
        handler_with(mode, Arc::new(NoopMetrics))
    }

    fn handler_with(
        mode: SigningMode,
        metrics: Arc<dyn MetricsSink>,
    ) -> (Arc<RpcHandler>, Arc<DominanceEngine>, Arc<ReplicaStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(DominanceEngine::new(EngineParams::default(), metrics.clone()).with_journal(store.clone()));
        let admission = Arc::new(
            AdmissionPipeline::from_config(
                &AdmissionConfig::default().with_validation(ValidationConfig::default().with_dimensions(2)),
                metrics.clone(),
            )
            .unwrap(),
        );
        let replicas = Arc::new(ReplicaStore::new("node-a", store, 3, metrics.clone()));
        let h = Arc::new(RpcHandler::new(engine.clone(), admission, replicas.clone(), mode, metrics));
        (h, engine, replicas)
    }

    fn broadcast(id: &str, vector: Vec<f64>) -> BroadcastMessage {
        BroadcastMessage {
            id: id.into(),
            vector,
            energy: 2.0,
        }
    }

    #[test]
    fn accepted_broadcast_is_ingested_and_replicated() {
        let (h, engine, replicas) = handler(SigningMode::SenderSigns);
        let ack = h.handle_broadcast("10.0.0.1", broadcast("x", vec![1.0, 0.0]));
        assert_eq!(ack.status, AckStatus::Ok);
        assert!(engine.get("x").is_some());
        assert_eq!(replicas.get("x").unwrap().approvals.get("node-a"), 1);

        let again = h.handle_broadcast("10.0.0.1", broadcast("x", vec![1.0, 0.0]));
        assert_eq!(again.status, AckStatus::RejectedDuplicate);
    }

    #[test]
    fn rejected_broadcast_touches_nothing() {
        let (h, engine, replicas) = handler(SigningMode::SenderSigns);
        let ack = h.handle_broadcast("10.0.0.1", broadcast("x", vec![1.0]));
        assert_eq!(ack.status, AckStatus::RejectedValidation);
        assert!(ack.detail.unwrap().contains("VECTOR_DIMENSION_MISMATCH"));
        assert!(engine.is_empty());
        assert!(replicas.get("x").is_none());
    }

    #[test]
    fn commit_signature_modes() {
        let signer = NodeSigner::new(SigningKey::generate(&mut rand::thread_rng()));
        let c = Candidate::new("x", vec![1.0, 0.0], 2.0);

        let (strict, engine, _) = handler(SigningMode::SenderSigns);
        let signed = signer.commit_message(&c, SigningMode::SenderSigns);
        let unsigned = signer.commit_message(&c, SigningMode::ReceiverSigns);
        assert_eq!(strict.handle_commit("p", &unsigned).status, AckStatus::InvalidSignature);
        assert!(engine.is_empty());
        assert_eq!(strict.handle_commit("p", &signed).status, AckStatus::Committed);
        assert_eq!(engine.get("x"), Some(c.clone()));
        assert_eq!(engine.replay_log(), 1);

        let (lenient, _, _) = handler(SigningMode::ReceiverSigns);
        assert_eq!(lenient.handle_commit("p", &unsigned).status, AckStatus::Committed);
    }

    #[test]
    fn malformed_commit_is_an_error() {
        let signer = NodeSigner::new(SigningKey::generate(&mut rand::thread_rng()));
        let (h, engine, _) = handler(SigningMode::SenderSigns);
        let msg = signer.commit_message(&Candidate::new("x", vec![f64::NAN, 0.0], 1.0), SigningMode::SenderSigns);
        assert_eq!(h.handle_commit("p", &msg).status, AckStatus::Error);
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn commit_over_async_path_is_persisted_and_timed() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let (h, engine, _) = handler_with(SigningMode::SenderSigns, metrics.clone());
        let signer = NodeSigner::new(SigningKey::generate(&mut rand::thread_rng()));
        let c = Candidate::new("x", vec![1.0, 0.0], 2.0);

        let reply = h
            .handle("p", Request::Commit(signer.commit_message(&c, SigningMode::SenderSigns)))
            .await;
        assert_eq!(reply, Response::Ack(Ack::new(AckStatus::Committed)));
        assert_eq!(engine.get("x"), Some(c));
        assert_eq!(engine.replay_log(), 1);
        assert_eq!(metrics.count(MetricEvent::RpcCommit), 1);
        assert_eq!(metrics.latency_samples(MetricEvent::RpcCommit), 1);
    }

    async fn start(server: RpcServer) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<Result<()>>) {
        let addr = server.local_addr().unwrap();
        let (stop, stop_rx) = watch::channel(false);
        (addr, stop, tokio::spawn(server.run(stop_rx)))
    }

    #[tokio::test]
    async fn oversized_line_closes_the_connection() {
        let (h, engine, _) = handler(SigningMode::SenderSigns);
        let server = RpcServer::bind("127.0.0.1:0".parse().unwrap(), h)
            .await
            .unwrap()
            .with_max_frame_bytes(64);
        let (addr, stop, running) = start(server).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[b'x'; 200]).await.unwrap();

        let mut received = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut received))
            .await
            .expect("server should drop the connection");
        // A reset can race the error reply; either way the connection is gone
        if closed.is_ok() && !received.is_empty() {
            assert!(String::from_utf8_lossy(&received).contains("exceeds 64 bytes"));
        }
        assert!(engine.is_empty());

        stop.send(true).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_connection_is_closed() {
        let (h, _, _) = handler(SigningMode::SenderSigns);
        let server = RpcServer::bind("127.0.0.1:0".parse().unwrap(), h)
            .await
            .unwrap()
            .with_idle_timeout(Duration::from_millis(100));
        let (addr, stop, running) = start(server).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut received = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut received))
            .await
            .expect("server should close an idle connection");
        assert_eq!(read.unwrap(), 0);

        stop.send(true).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn serves_requests_over_tcp() {
        let (h, _, _) = handler(SigningMode::SenderSigns);
        let server = RpcServer::bind("127.0.0.1:0".parse().unwrap(), h).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let (stop, stop_rx) = watch::channel(false);
        let running = tokio::spawn(server.run(stop_rx));

        let client = TcpTransport::new(Duration::from_secs(2));
        let ack = client
            .call(&addr, Request::Broadcast(broadcast("x", vec![1.0, 0.0])))
            .await
            .unwrap();
        assert_eq!(ack, Response::Ack(Ack::new(AckStatus::Ok)));

        let sync = client
            .call(
                &addr,
                Request::Sync(SyncRequest {
                    sender_id: "node-b".into(),
                    records: BTreeMap::new(),
                }),
            )
            .await
            .unwrap();
        match sync {
            Response::Sync(resp) => assert!(resp.records.contains_key("x")),
            other => panic!("unexpected {other:?}"),
        }

        stop.send(true).unwrap();
        running.await.unwrap().unwrap();
    }
}
