//! Outbound RPC: newline-delimited JSON over TCP.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::trace;

use crate::wire::{Request, Response};

/// Why an outbound call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer unavailable: {0}")]
    Unavailable(String),

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("peer out of resources: {0}")]
    ResourceExhausted(String),

    #[error("call aborted: {0}")]
    Aborted(String),

    #[error("peer internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("circuit open for {0}")]
    CircuitOpen(String),
}

impl TransportError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_)
                | Self::DeadlineExceeded(_)
                | Self::ResourceExhausted(_)
                | Self::Aborted(_)
                | Self::Internal(_)
                | Self::Io(_)
        )
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotConnected | io::ErrorKind::AddrNotAvailable => {
                Self::Unavailable(e.to_string())
            }
            io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                Self::Aborted(e.to_string())
            }
            io::ErrorKind::TimedOut => Self::DeadlineExceeded(Duration::ZERO),
            io::ErrorKind::InvalidInput => Self::InvalidArgument(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

/// One request, one response, to a named peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn call(&self, peer: &str, request: Request) -> Result<Response, TransportError>;
}

/// Opens a connection per call and bounds the whole exchange by a deadline.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(peer: &str, request: &Request) -> Result<Response, TransportError> {
        let mut line = serde_json::to_string(request).map_err(|e| TransportError::InvalidArgument(e.to_string()))?;
        line.push('\n');

        let stream = TcpStream::connect(peer).await?;
        let (reader, mut writer) = stream.into_split();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        let mut reader = BufReader::new(reader);
        let mut reply = String::new();
        if reader.read_line(&mut reply).await? == 0 {
            return Err(TransportError::Aborted("connection closed before reply".into()));
        }

        match serde_json::from_str(reply.trim_end()) {
            Ok(Response::Error { message }) => Err(TransportError::Internal(message)),
            Ok(response) => Ok(response),
            Err(e) => Err(TransportError::Protocol(e.to_string())),
        }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn call(&self, peer: &str, request: Request) -> Result<Response, TransportError> {
        trace!(peer, kind = request.kind(), "sending request");
        match tokio::time::timeout(self.timeout, Self::exchange(peer, &request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::DeadlineExceeded(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Ack, AckStatus, BroadcastMessage};
    use tokio::net::TcpListener;

    fn broadcast() -> Request {
        Request::Broadcast(BroadcastMessage {
            id: "a".into(),
            vector: vec![1.0],
            energy: 1.0,
        })
    }

    #[test]
    fn transient_classification() {
        assert!(TransportError::Unavailable("x".into()).is_transient());
        assert!(TransportError::DeadlineExceeded(Duration::from_secs(1)).is_transient());
        assert!(TransportError::Io("x".into()).is_transient());
        assert!(!TransportError::InvalidArgument("x".into()).is_transient());
        assert!(!TransportError::Protocol("x".into()).is_transient());
        assert!(!TransportError::CircuitOpen("x".into()).is_transient());
    }

    #[test]
    fn refused_connection_is_unavailable() {
        let e = TransportError::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(matches!(e, TransportError::Unavailable(_)));
    }

    #[tokio::test]
    async fn exchanges_one_line_each_way() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut line = String::new();
            BufReader::new(reader).read_line(&mut line).await.unwrap();
            let _: Request = serde_json::from_str(line.trim_end()).unwrap();
            let reply = serde_json::to_string(&Response::Ack(Ack::new(AckStatus::Ok))).unwrap();
            writer.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
        });

        let transport = TcpTransport::new(Duration::from_secs(2));
        let response = transport.call(&addr, broadcast()).await.unwrap();
        assert_eq!(response, Response::Ack(Ack::new(AckStatus::Ok)));
    }

    #[tokio::test]
    async fn silent_peer_hits_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let transport = TcpTransport::new(Duration::from_millis(50));
        let err = transport.call(&addr, broadcast()).await.unwrap_err();
        assert_eq!(err, TransportError::DeadlineExceeded(Duration::from_millis(50)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn error_reply_is_internal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut line = String::new();
            BufReader::new(reader).read_line(&mut line).await.unwrap();
            let reply = serde_json::to_string(&Response::Error { message: "boom".into() }).unwrap();
            writer.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
        });

        let transport = TcpTransport::new(Duration::from_secs(2));
        assert_eq!(
            transport.call(&addr, broadcast()).await.unwrap_err(),
            TransportError::Internal("boom".into())
        );
    }
}
