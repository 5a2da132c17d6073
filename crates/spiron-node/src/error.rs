//! Error types for the Spiron node.

use thiserror::Error;

use crate::transport::TransportError;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a node.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error, naming the offending variable
    #[error("Config error: {0}")]
    Config(String),

    /// Admission setup error
    #[error("Admission error: {0}")]
    Admission(#[from] spiron_admission::Error),

    /// Outbound call failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<spiron_core::Error> for Error {
    fn from(e: spiron_core::Error) -> Self {
        match e {
            spiron_core::Error::Serialization(e) => Error::Serialization(e),
            spiron_core::Error::Metrics(m) => Error::Metrics(m),
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<Error> for spiron_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Serialization(e) => spiron_core::Error::Serialization(e),
            other => spiron_core::Error::Storage(other.to_string()),
        }
    }
}
