//! Error types for the stream broker

use thiserror::Error;

/// Broker error types
#[derive(Debug, Error)]
pub enum Error {
    /// The registry (or the whole broker) has been shut down; the
    /// caller must close the connection it was trying to hand over.
    #[error("Broker is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, Error>;
