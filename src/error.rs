//! Error taxonomy for the routing core
//!
//! Transient backend failures are retried via the per-shard retry buffer and
//! never surfaced to producers; configuration-class errors are fatal for the
//! process.

use thiserror::Error;

/// Errors produced by the routing core
#[derive(Debug, Error)]
pub enum RouterError {
    /// Transient backend failure (connection refused, timeout, reset)
    #[error("backend connection error: {0}")]
    Connection(#[from] redis::RedisError),

    /// Invalid configuration or malformed data that cannot be acted on
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Routing service returned a failure or an unusable payload
    #[error("routing service error: {0}")]
    Discovery(String),

    /// HTTP transport failure talking to the routing service
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Disk log I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Disk log record encoding/decoding failure
    #[error("encoding error: {0}")]
    Encoding(#[from] Box<bincode::ErrorKind>),

    /// Control message or packet (de)serialization failure
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A mapped write addressed a shard tag not present in the routing table
    #[error("unknown shard tag: {0}")]
    UnknownShard(String),
}

pub type Result<T> = std::result::Result<T, RouterError>;

/// Terminate the process on a configuration-class failure.
///
/// Used where continuing would risk silently dropping data: a persist
/// failure while persistence is required, or a corrupt on-disk record.
pub(crate) fn fatal(message: &str) -> ! {
    tracing::error!("fatal: {}", message);
    std::process::exit(1);
}
