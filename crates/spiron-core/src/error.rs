//! Error types for the dominance engine and its collaborators.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by stores and the lineage tracker.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store has been closed
    #[error("store is closed")]
    Closed,

    /// Metrics registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Metrics(e.to_string())
    }
}
