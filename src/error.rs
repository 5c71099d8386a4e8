//! Error types for membrane.

use crate::protocol::wire::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for membrane.
#[derive(Error, Debug)]
pub enum MembraneError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("spawning worker: {0}")]
    Spawn(String),

    #[error("no available worker within {waited:?} (pool exhausted)")]
    PoolExhausted { waited: Duration },

    #[error("request timeout after {elapsed:?}")]
    RequestTimeout { elapsed: Duration },

    #[error("worker {id}: writing request: {source}")]
    WorkerWrite { id: u32, source: ProtocolError },

    #[error("worker {id}: reading response: {source}")]
    WorkerRead { id: u32, source: ProtocolError },

    #[error("worker {id}: protocol violation: {source}")]
    ProtocolViolation { id: u32, source: ProtocolError },

    #[error("worker error: {0}")]
    WorkerReported(String),

    #[error("pool is shutting down")]
    Shutdown,

    #[error("connection limit reached ({max})")]
    ConnectionLimit { max: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for membrane operations.
pub type Result<T> = std::result::Result<T, MembraneError>;
