//! Candidate values.

use serde::{Deserialize, Serialize};

/// An identified vector competing for dominance.
///
/// Treated as an immutable value: merging and damping produce a new
/// candidate rather than editing one in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Candidate id
    pub id: String,
    /// Fixed-dimension vector
    pub vector: Vec<f64>,
    /// Current energy, always finite
    pub energy: f64,
    /// Id of the candidate most recently absorbed into this one
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl Candidate {
    /// Create a root candidate.
    pub fn new(id: impl Into<String>, vector: Vec<f64>, energy: f64) -> Self {
        Self {
            id: id.into(),
            vector,
            energy,
            parent_id: None,
        }
    }

    /// Same candidate, different energy.
    #[must_use]
    pub fn with_energy(&self, energy: f64) -> Self {
        Self {
            energy,
            ..self.clone()
        }
    }

    /// Same candidate, new energy, with `parent` recorded as absorbed.
    #[must_use]
    pub fn absorbing(&self, energy: f64, parent: &str) -> Self {
        Self {
            energy,
            parent_id: Some(parent.to_string()),
            ..self.clone()
        }
    }

    /// Vector dimension.
    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }
}
