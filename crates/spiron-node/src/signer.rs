//! Commit signing and verification.
//!
//! Commits carry an ed25519 signature over a canonical byte encoding of the
//! candidate. A node can instead be configured for [`SigningMode::ReceiverSigns`],
//! which accepts unsigned commits. That mode bypasses authentication and is
//! meant for development clusters only; it is never the default.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use spiron_core::Candidate;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::wire::CommitMessage;

/// Signature scheme tag for ed25519-signed commits.
pub const SCHEME_ED25519: &str = "ed25519";

/// Scheme tag for commits sent without a sender signature.
pub const SCHEME_RECEIVER_SIGNS: &str = "receiver-signs";

/// How this node authenticates inbound commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningMode {
    /// Every commit must carry a valid sender signature
    SenderSigns,
    /// Unsigned commits are accepted. Development only.
    ReceiverSigns,
}

impl fmt::Display for SigningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SenderSigns => write!(f, "sender-signs"),
            Self::ReceiverSigns => write!(f, "receiver-signs"),
        }
    }
}

impl FromStr for SigningMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sender-signs" => Ok(Self::SenderSigns),
            "receiver-signs" => Ok(Self::ReceiverSigns),
            other => Err(format!(
                "unknown signing mode {other:?} (expected sender-signs or receiver-signs)"
            )),
        }
    }
}

/// Compute a node id from its public key.
///
/// hash₁ = BLAKE3(pubkey), hash₂ = BLAKE3(hash₁), id = "b3b3/{hash₂}"
pub fn compute_node_id(pubkey: &VerifyingKey) -> String {
    let hash1 = blake3::hash(pubkey.as_bytes());
    let hash2 = blake3::hash(hash1.as_bytes());
    format!("b3b3/{}", hex::encode(hash2.as_bytes()))
}

/// Canonical bytes signed for a commit.
///
/// Id and parent are length-prefixed so no two candidates share an encoding.
pub fn commit_payload(id: &str, vector: &[f64], energy: f64, parent_id: Option<&str>) -> Vec<u8> {
    let parent = parent_id.unwrap_or("");
    let mut buf = Vec::with_capacity(16 + id.len() + parent.len() + 8 * (vector.len() + 1));
    buf.extend_from_slice(&(id.len() as u64).to_le_bytes());
    buf.extend_from_slice(id.as_bytes());
    buf.extend_from_slice(&(parent.len() as u64).to_le_bytes());
    buf.extend_from_slice(parent.as_bytes());
    buf.extend_from_slice(&energy.to_le_bytes());
    for x in vector {
        buf.extend_from_slice(&x.to_le_bytes());
    }
    buf
}

/// Verify `sig` over `msg` with raw public key bytes.
pub fn verify(pubkey: &[u8], msg: &[u8], sig: &[u8]) -> bool {
    let Ok(pubkey) = <[u8; 32]>::try_from(pubkey) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&pubkey) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(sig) else {
        return false;
    };
    key.verify(msg, &sig).is_ok()
}

/// This node's signing identity.
pub struct NodeSigner {
    key: SigningKey,
    node_id: String,
}

impl NodeSigner {
    pub fn new(key: SigningKey) -> Self {
        let node_id = compute_node_id(&key.verifying_key());
        Self { key, node_id }
    }

    /// `b3b3/...` id derived from the public key.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.key.sign(msg).to_bytes().to_vec()
    }

    /// Build an outbound commit for `candidate` under `mode`.
    pub fn commit_message(&self, candidate: &Candidate, mode: SigningMode) -> CommitMessage {
        let mut msg = CommitMessage {
            id: candidate.id.clone(),
            vector: candidate.vector.clone(),
            energy: candidate.energy,
            parent_id: candidate.parent_id.clone(),
            signer_public_key: None,
            signature: None,
            sig_scheme: SCHEME_RECEIVER_SIGNS.to_string(),
        };
        if mode == SigningMode::SenderSigns {
            let payload = commit_payload(&msg.id, &msg.vector, msg.energy, msg.parent_id.as_deref());
            msg.signer_public_key = Some(hex::encode(self.key.verifying_key().as_bytes()));
            msg.signature = Some(hex::encode(self.sign(&payload)));
            msg.sig_scheme = SCHEME_ED25519.to_string();
        }
        msg
    }
}

impl fmt::Debug for NodeSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSigner").field("node_id", &self.node_id).finish_non_exhaustive()
    }
}

/// Whether an inbound commit is authentic under `mode`.
///
/// Signed ed25519 commits are checked in both modes. Unsigned or
/// `receiver-signs` commits pass only in [`SigningMode::ReceiverSigns`].
/// Any other scheme is refused.
pub fn verify_commit(mode: SigningMode, commit: &CommitMessage) -> bool {
    let key = commit.signer_public_key.as_deref().filter(|k| !k.is_empty());
    let sig = commit.signature.as_deref().filter(|s| !s.is_empty());

    match (commit.sig_scheme.as_str(), key, sig) {
        (SCHEME_ED25519, Some(key), Some(sig)) => {
            let (Ok(key), Ok(sig)) = (hex::decode(key), hex::decode(sig)) else {
                warn!(id = %commit.id, "commit signature is not valid hex");
                return false;
            };
            let payload = commit_payload(&commit.id, &commit.vector, commit.energy, commit.parent_id.as_deref());
            verify(&key, &payload, &sig)
        }
        (SCHEME_RECEIVER_SIGNS, _, _) | (_, None, None) => {
            if mode == SigningMode::ReceiverSigns {
                debug!(id = %commit.id, "accepting unsigned commit in receiver-signs mode");
                true
            } else {
                warn!(id = %commit.id, scheme = %commit.sig_scheme, "unsigned commit refused");
                false
            }
        }
        (scheme, _, _) => {
            warn!(id = %commit.id, scheme, "unknown or incomplete signature scheme");
            false
        }
    }
}
