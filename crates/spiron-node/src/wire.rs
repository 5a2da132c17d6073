//! Wire messages: one JSON object per line.

use serde::{Deserialize, Serialize};
use spiron_admission::Rejection;
use spiron_core::Candidate;
use spiron_crdt::ReplicatedRecord;
use std::collections::BTreeMap;
use std::fmt;

/// A candidate offered to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub id: String,
    #[serde(default)]
    pub vector: Vec<f64>,
    pub energy: f64,
}

impl BroadcastMessage {
    pub fn into_candidate(self) -> Candidate {
        Candidate::new(self.id, self.vector, self.energy)
    }
}

impl From<&Candidate> for BroadcastMessage {
    fn from(c: &Candidate) -> Self {
        Self {
            id: c.id.clone(),
            vector: c.vector.clone(),
            energy: c.energy,
        }
    }
}

/// A committed candidate, optionally signed by its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMessage {
    pub id: String,
    #[serde(default)]
    pub vector: Vec<f64>,
    pub energy: f64,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Hex-encoded ed25519 public key
    #[serde(default)]
    pub signer_public_key: Option<String>,
    /// Hex-encoded signature
    #[serde(default)]
    pub signature: Option<String>,
    pub sig_scheme: String,
}

impl CommitMessage {
    pub fn to_candidate(&self) -> Candidate {
        Candidate {
            id: self.id.clone(),
            vector: self.vector.clone(),
            energy: self.energy,
            parent_id: self.parent_id.clone(),
        }
    }
}

/// Full replicated state from a gossiping peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub sender_id: String,
    pub records: BTreeMap<String, ReplicatedRecord>,
}

/// The receiver's full state after merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub records: BTreeMap<String, ReplicatedRecord>,
}

/// Outcome reported for a broadcast or commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    RejectedValidation,
    RejectedDuplicate,
    RejectedRatelimit,
    RejectedAllowlist,
    Committed,
    #[serde(rename = "invalid-signature")]
    InvalidSignature,
    Error,
}

impl AckStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::RejectedValidation => "rejected_validation",
            Self::RejectedDuplicate => "rejected_duplicate",
            Self::RejectedRatelimit => "rejected_ratelimit",
            Self::RejectedAllowlist => "rejected_allowlist",
            Self::Committed => "committed",
            Self::InvalidSignature => "invalid-signature",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&Rejection> for AckStatus {
    fn from(r: &Rejection) -> Self {
        match r {
            Rejection::Allowlist => Self::RejectedAllowlist,
            Rejection::RateLimit => Self::RejectedRatelimit,
            Rejection::Validation(_) => Self::RejectedValidation,
            Rejection::Duplicate => Self::RejectedDuplicate,
        }
    }
}

/// Acknowledgement with an optional human-readable detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Ack {
    pub fn new(status: AckStatus) -> Self {
        Self { status, detail: None }
    }

    pub fn with_detail(status: AckStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
        }
    }
}

impl From<&Rejection> for Ack {
    fn from(r: &Rejection) -> Self {
        Self::with_detail(r.into(), r.to_string())
    }
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Broadcast(BroadcastMessage),
    Commit(CommitMessage),
    Sync(SyncRequest),
}

impl Request {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Broadcast(_) => "broadcast",
            Self::Commit(_) => "commit",
            Self::Sync(_) => "sync",
        }
    }
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack(Ack),
    Sync(SyncResponse),
    Error { message: String },
}
