//! Error types and handling for repository connection pooling

use thiserror::Error;

/// Result type alias for repopool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the pool, by sources, and by connections.
///
/// Errors that mean the system cannot produce a usable connection
/// ([`Error::Config`], [`Error::PoolNotRunning`], [`Error::PoolExhausted`],
/// [`Error::Source`]) propagate to the caller. Errors that mean a particular
/// connection instance went bad are absorbed by the pool, which discards the
/// connection and retries.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Repository source error: {0}")]
    Source(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Connection pool for {0} is not running")]
    PoolNotRunning(String),

    #[error("Unable to obtain a valid connection to {source} after {attempts} attempts")]
    PoolExhausted { source: String, attempts: u32 },

    #[error("Closed connection may not be used")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
