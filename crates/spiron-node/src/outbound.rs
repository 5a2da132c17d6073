//! Fan-out of broadcasts and commits to every peer.

use futures::future::join_all;
use spiron_core::{Candidate, CommitPropagator};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::resilience::{ResilientClient, RetryPolicy};
use crate::signer::{NodeSigner, SigningMode};
use crate::transport::TransportError;
use crate::wire::{BroadcastMessage, Request, Response};

/// Result of delivering to one peer.
pub type Delivery = (String, Result<Response, TransportError>);

/// In-flight deliveries. Dropping it leaves them running.
#[derive(Debug, Default)]
pub struct FanOut {
    handles: Vec<(String, JoinHandle<Result<Response, TransportError>>)>,
}

impl FanOut {
    /// Number of peers targeted.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every delivery.
    pub async fn join(self) -> Vec<Delivery> {
        let (peers, handles): (Vec<_>, Vec<_>) = self.handles.into_iter().unzip();
        let results = join_all(handles).await;
        peers
            .into_iter()
            .zip(results)
            .map(|(peer, joined)| {
                let result = joined.unwrap_or_else(|e| Err(TransportError::Aborted(e.to_string())));
                (peer, result)
            })
            .collect()
    }
}

/// Sends to all peers through a bounded worker pool.
///
/// Each peer has its own breaker and retry budget; one slow peer holds a
/// worker, not the caller.
pub struct Outbound {
    client: Arc<ResilientClient>,
    peers: Vec<String>,
    workers: Arc<Semaphore>,
    policy: RetryPolicy,
    signer: Arc<NodeSigner>,
    signing_mode: SigningMode,
}

impl Outbound {
    pub fn new(
        client: Arc<ResilientClient>,
        peers: Vec<String>,
        workers: usize,
        policy: RetryPolicy,
        signer: Arc<NodeSigner>,
        signing_mode: SigningMode,
    ) -> Self {
        Self {
            client,
            peers,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            policy,
            signer,
            signing_mode,
        }
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Offer `candidate` to every peer.
    pub fn broadcast(&self, candidate: &Candidate) -> FanOut {
        self.fan_out(Request::Broadcast(BroadcastMessage::from(candidate)))
    }

    /// Send `candidate` as a commit, signed according to the signing mode.
    pub fn send_commit(&self, candidate: &Candidate) -> FanOut {
        let commit = self.signer.commit_message(candidate, self.signing_mode);
        self.fan_out(Request::Commit(commit))
    }

    fn fan_out(&self, request: Request) -> FanOut {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(kind = request.kind(), "no async runtime; outbound delivery dropped");
            return FanOut::default();
        };

        let handles = self
            .peers
            .iter()
            .map(|peer| {
                let client = Arc::clone(&self.client);
                let workers = Arc::clone(&self.workers);
                let policy = self.policy.clone();
                let request = request.clone();
                let target = peer.clone();

                let handle = runtime.spawn(async move {
                    let _permit = match workers.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => return Err(TransportError::Aborted(e.to_string())),
                    };
                    let kind = request.kind();
                    let result = client.call(&target, request, &policy).await;
                    match &result {
                        Ok(response) => debug!(peer = %target, kind, ?response, "delivered"),
                        Err(e) => warn!(peer = %target, kind, error = %e, "delivery failed"),
                    }
                    result
                });
                (peer.clone(), handle)
            })
            .collect();

        FanOut { handles }
    }
}

impl CommitPropagator for Outbound {
    fn propagate_commit(&self, candidate: &Candidate) {
        let pending = self.send_commit(candidate);
        debug!(id = %candidate.id, peers = pending.len(), "commit fan-out started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BreakerConfig;
    use crate::signer::{verify_commit, SCHEME_ED25519};
    use crate::transport::PeerTransport;
    use crate::wire::{Ack, AckStatus};
    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use parking_lot::Mutex;
    use spiron_core::NoopMetrics;
    use std::time::Duration;

    #[derive(Default)]
    struct Capture {
        seen: Mutex<Vec<(String, Request)>>,
    }

    #[async_trait]
    impl PeerTransport for Capture {
        async fn call(&self, peer: &str, request: Request) -> Result<Response, TransportError> {
            if peer == "down" {
                return Err(TransportError::InvalidArgument("down".into()));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.seen.lock().push((peer.to_string(), request));
            Ok(Response::Ack(Ack::new(AckStatus::Ok)))
        }
    }

    fn outbound(transport: Arc<Capture>, peers: &[&str]) -> Outbound {
        let client = Arc::new(ResilientClient::new(transport, BreakerConfig::default(), Arc::new(NoopMetrics)));
        Outbound::new(
            client,
            peers.iter().map(|p| p.to_string()).collect(),
            2,
            RetryPolicy::none(),
            Arc::new(NodeSigner::new(SigningKey::generate(&mut rand::thread_rng()))),
            SigningMode::SenderSigns,
        )
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer() {
        let transport = Arc::new(Capture::default());
        let out = outbound(transport.clone(), &["a", "b", "c"]);

        let results = out.broadcast(&Candidate::new("x", vec![1.0], 1.0)).join().await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(transport.seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn one_failing_peer_does_not_affect_others() {
        let transport = Arc::new(Capture::default());
        let out = outbound(transport.clone(), &["a", "down"]);

        let results = out.broadcast(&Candidate::new("x", vec![1.0], 1.0)).join().await;
        let failed: Vec<_> = results.iter().filter(|(_, r)| r.is_err()).map(|(p, _)| p.as_str()).collect();
        assert_eq!(failed, vec!["down"]);
    }

    #[tokio::test]
    async fn commits_are_signed() {
        let transport = Arc::new(Capture::default());
        let out = outbound(transport.clone(), &["a"]);
        out.send_commit(&Candidate::new("x", vec![1.0], 1.0)).join().await;

        let seen = transport.seen.lock();
        match &seen[0].1 {
            Request::Commit(c) => {
                assert_eq!(c.sig_scheme, SCHEME_ED25519);
                assert!(verify_commit(SigningMode::SenderSigns, c));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn without_runtime_nothing_is_sent() {
        let transport = Arc::new(Capture::default());
        let out = outbound(transport, &["a"]);
        assert!(out.broadcast(&Candidate::new("x", vec![1.0], 1.0)).is_empty());
    }
}
