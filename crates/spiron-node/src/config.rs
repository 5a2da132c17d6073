//! Node configuration from `SPIRON_*` environment variables.

use spiron_admission::{AdmissionConfig, ValidationConfig, DEFAULT_ID_PATTERN};
use spiron_core::EngineParams;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::gossip::GossipConfig;
use crate::resilience::{BreakerConfig, RetryPolicy};
use crate::server::DEFAULT_MAX_FRAME_BYTES;
use crate::signer::SigningMode;
use crate::storage::StorageBackend;

/// Largest vector dimension a node will accept.
pub const MAX_VECTOR_DIMENSIONS: usize = 8192;

/// Configuration for a Spiron node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// RPC listen address
    pub listen_addr: SocketAddr,

    /// Peer RPC addresses
    pub peers: Vec<String>,

    /// Data directory for the embedded store
    pub data_dir: PathBuf,

    /// Which store to open
    pub storage: StorageBackend,

    /// Merge and commit tuning
    pub engine: EngineParams,

    /// How often the dominant candidate is checked for commit
    pub commit_interval: Duration,

    /// Inbound broadcast gates
    pub admission: AdmissionConfig,

    /// Gossip timing
    pub gossip: GossipConfig,

    /// Cumulative approvals needed for finality
    pub finality_threshold: u64,

    /// Retry policy for broadcasts and commits
    pub retry: RetryPolicy,

    /// Per-peer circuit breaker
    pub breaker: BreakerConfig,

    /// Deadline for one outbound RPC, and the idle limit on inbound connections
    pub rpc_timeout: Duration,

    /// Longest inbound request line
    pub rpc_max_frame_bytes: usize,

    /// Concurrent outbound deliveries
    pub rpc_workers: usize,

    /// How inbound commits are authenticated
    pub signing_mode: SigningMode,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            peers: Vec::new(),
            data_dir: PathBuf::from("./spiron-data"),
            storage: StorageBackend::RocksDb,
            engine: EngineParams::default(),
            commit_interval: Duration::from_millis(300),
            admission: AdmissionConfig::default(),
            gossip: GossipConfig::default(),
            finality_threshold: 3,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            rpc_timeout: Duration::from_millis(2000),
            rpc_max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            rpc_workers: 4,
            signing_mode: SigningMode::SenderSigns,
        }
    }
}

impl NodeConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create config from any name → value lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Self::default();

        let peers = env
            .raw("SPIRON_PEERS")
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let engine = EngineParams::default()
            .with_damping_alpha(env.parse("SPIRON_DAMPING_ALPHA", defaults.engine.damping_alpha)?)
            .with_siphon_factor(env.parse("SPIRON_SIPHON_FACTOR", defaults.engine.siphon_factor)?)
            .with_angular_threshold(env.parse("SPIRON_ANGULAR_THRESHOLD", defaults.engine.angular_threshold)?)
            .with_commit_energy(env.parse("SPIRON_COMMIT_ENERGY", defaults.engine.commit_energy)?);

        let dimensions: usize = env.parse("SPIRON_VECTOR_DIMENSIONS", 128)?;
        if dimensions == 0 || dimensions > MAX_VECTOR_DIMENSIONS {
            return Err(Error::Config(format!(
                "SPIRON_VECTOR_DIMENSIONS must be in 1..={MAX_VECTOR_DIMENSIONS}, got {dimensions}"
            )));
        }
        let min_energy: f64 = env.parse("SPIRON_MIN_ENERGY", 0.0)?;
        let max_energy: f64 = env.parse("SPIRON_MAX_ENERGY", 1000.0)?;
        if !(min_energy.is_finite() && max_energy.is_finite() && min_energy <= max_energy) {
            return Err(Error::Config(format!(
                "SPIRON_MIN_ENERGY/SPIRON_MAX_ENERGY must be finite with min <= max, got [{min_energy}, {max_energy}]"
            )));
        }
        let validation = ValidationConfig::default()
            .with_dimensions(dimensions)
            .with_id_pattern(env.string("SPIRON_ID_PATTERN", DEFAULT_ID_PATTERN))
            .with_energy_range(min_energy, max_energy);

        let admission = AdmissionConfig::default()
            .with_peer_allowlist(env.string("SPIRON_PEER_ALLOWLIST", ""))
            .with_rate_limit(env.parse("SPIRON_RATE_LIMIT_PER_SECOND", 100)?)
            .with_duplicate_expiry(env.millis("SPIRON_DUPLICATE_EXPIRY_MS", 60_000)?)
            .with_validation(validation);

        let retry = RetryPolicy::default()
            .with_max_attempts(env.parse("SPIRON_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?)
            .with_initial_delay(env.millis("SPIRON_RETRY_INITIAL_DELAY_MS", 10)?)
            .with_max_delay(env.millis("SPIRON_RETRY_MAX_DELAY_MS", 500)?)
            .with_multiplier(env.parse("SPIRON_RETRY_BACKOFF_MULTIPLIER", defaults.retry.multiplier)?);
        if retry.max_attempts == 0 {
            return Err(Error::Config("SPIRON_RETRY_MAX_ATTEMPTS must be at least 1".into()));
        }
        if retry.multiplier.is_nan() || retry.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "SPIRON_RETRY_BACKOFF_MULTIPLIER must be >= 1.0, got {}",
                retry.multiplier
            )));
        }

        let breaker = BreakerConfig::default()
            .with_failure_threshold(env.parse("SPIRON_BREAKER_THRESHOLD", defaults.breaker.failure_threshold)?)
            .with_cooldown(env.millis("SPIRON_BREAKER_COOLDOWN_MS", 5000)?);

        let rpc_workers: usize = env.parse("SPIRON_RPC_WORKERS", defaults.rpc_workers)?;
        if rpc_workers == 0 {
            return Err(Error::Config("SPIRON_RPC_WORKERS must be at least 1".into()));
        }
        let rpc_max_frame_bytes: usize = env.parse("SPIRON_RPC_MAX_FRAME_BYTES", defaults.rpc_max_frame_bytes)?;
        if rpc_max_frame_bytes == 0 {
            return Err(Error::Config("SPIRON_RPC_MAX_FRAME_BYTES must be at least 1".into()));
        }

        Ok(Self {
            listen_addr: env.parse("SPIRON_LISTEN_ADDR", defaults.listen_addr)?,
            peers,
            data_dir: PathBuf::from(env.string("SPIRON_DATA_DIR", "./spiron-data")),
            storage: env.parse("SPIRON_STORAGE", defaults.storage)?,
            engine,
            commit_interval: env.nonzero_millis("SPIRON_COMMIT_INTERVAL_MS", 300)?,
            admission,
            gossip: GossipConfig::default().with_interval(env.nonzero_millis("SPIRON_GOSSIP_INTERVAL_MS", 1000)?),
            finality_threshold: env.parse("SPIRON_FINALITY_THRESHOLD", defaults.finality_threshold)?,
            retry,
            breaker,
            rpc_timeout: env.nonzero_millis("SPIRON_RPC_TIMEOUT_MS", 2000)?,
            rpc_max_frame_bytes,
            rpc_workers,
            signing_mode: env.parse("SPIRON_SIGNING_MODE", defaults.signing_mode)?,
        })
    }

    #[must_use]
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    #[must_use]
    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    #[must_use]
    pub fn with_storage(mut self, storage: StorageBackend) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_admission(mut self, admission: AdmissionConfig) -> Self {
        self.admission = admission;
        self
    }

    #[must_use]
    pub fn with_signing_mode(mut self, mode: SigningMode) -> Self {
        self.signing_mode = mode;
        self
    }

    #[must_use]
    pub fn with_finality_threshold(mut self, threshold: u64) -> Self {
        self.finality_threshold = threshold;
        self
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.raw(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(name) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {name}={value:?}: {e}"))),
            None => Ok(default),
        }
    }

    fn millis(&self, name: &str, default: u64) -> Result<Duration> {
        self.parse(name, default).map(Duration::from_millis)
    }

    /// Periods and deadlines: zero would stall a ticker or expire every call.
    fn nonzero_millis(&self, name: &str, default: u64) -> Result<Duration> {
        let value = self.millis(name, default)?;
        if value.is_zero() {
            return Err(Error::Config(format!("{name} must be at least 1")));
        }
        Ok(value)
    }
}
