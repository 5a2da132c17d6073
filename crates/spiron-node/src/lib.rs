//! Spiron replica node.
//!
//! Wires the dominance engine, admission pipeline and replicated records to
//! the network:
//!
//! - [`server`]: inbound broadcast, commit and sync over newline-delimited JSON
//! - [`gossip`]: periodic full-state exchange with a random peer
//! - [`outbound`]: fan-out of broadcasts and commits through a worker pool
//! - [`resilience`]: retry with backoff and per-peer circuit breakers
//! - [`signer`]: ed25519 commit signatures and node identity
//! - [`storage`]: RocksDB or in-memory backend, picked by config

pub mod config;
pub mod error;
pub mod gossip;
pub mod node;
pub mod outbound;
pub mod replica;
pub mod resilience;
pub mod server;
pub mod signer;
pub mod storage;
pub mod transport;
pub mod wire;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use gossip::{GossipConfig, GossipScheduler, GossipService, RoundOutcome};
pub use node::SpironNode;
pub use outbound::{FanOut, Outbound};
pub use replica::ReplicaStore;
pub use resilience::{BreakerConfig, BreakerState, CircuitBreaker, ResilientClient, RetryPolicy};
pub use server::{RpcHandler, RpcServer};
pub use signer::{compute_node_id, NodeSigner, SigningMode};
pub use storage::{open_storage, RocksStore, StorageBackend};
pub use transport::{PeerTransport, TcpTransport, TransportError};
pub use wire::{Ack, AckStatus, Request, Response};
