//! Error types for building the admission pipeline.

use thiserror::Error;

/// Result type for admission setup.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration problems detected while building the pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// A configured pattern does not compile
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A numeric knob is out of range
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
