//! Head index error types
//!
//! Defines all errors that can occur in the WAL, recovery, index and
//! rotation layers.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the head index
#[derive(Error, Debug)]
pub enum HeadError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of a WAL record failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A WAL record passed envelope validation but its payload cannot be decoded.
    /// Never repaired by truncation.
    #[error("Undecodable WAL record in {path:?} at offset {offset}: {source}")]
    UndecodableRecord {
        path: PathBuf,
        offset: u64,
        #[source]
        source: DecodeError,
    },

    /// Chunk metas were replayed for a series that was never defined in the WAL
    #[error("WAL replay found chunk metas without a series definition (tenant {tenant}, fingerprint {fingerprint:#x})")]
    OrphanChunkMetas { tenant: String, fingerprint: u64 },

    /// The WAL was stopped; no further records are accepted
    #[error("WAL is closed")]
    WalClosed,

    /// The head manager has no active head yet
    #[error("Head manager not started")]
    NotStarted,

    /// The durable builder rejected a head or WAL group
    #[error("Build error: {0}")]
    Build(String),

    /// Label set could not be parsed
    #[error("Invalid labels: {0}")]
    InvalidLabels(String),

    /// Label matcher could not be parsed or compiled
    #[error("Invalid matcher: {0}")]
    InvalidMatcher(String),

    /// Query was cancelled by its caller
    #[error("Query cancelled")]
    Cancelled,

    /// Query ran past its deadline
    #[error("Query deadline exceeded")]
    DeadlineExceeded,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Reasons a WAL payload could not be decoded into a known record
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("unknown record type {0:#04x}")]
    UnknownRecordType(u8),

    #[error("payload: {0}")]
    Payload(#[from] bincode::Error),
}

impl From<bincode::Error> for HeadError {
    fn from(err: bincode::Error) -> Self {
        HeadError::Serialization(err.to_string())
    }
}

impl From<regex::Error> for HeadError {
    fn from(err: regex::Error) -> Self {
        HeadError::InvalidMatcher(err.to_string())
    }
}

/// Result type alias for head index operations
pub type HeadResult<T> = Result<T, HeadError>;
