//! Catalog Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A catalog error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Not a hex-encoded SHA-256 digest.
    #[display("invalid content hash: {_0:?}")]
    InvalidHash(#[error(not(source))] String),
    #[display("could not serialize catalog")]
    Serialize,
    /// A stored catalog document could not be parsed.
    #[display("catalog document at {_0} is not valid")]
    Corrupt(#[error(not(source))] String),
    /// Snapshots are immutable once published.
    #[display("snapshot {_0} already exists")]
    SnapshotExists(#[error(not(source))] String),
    /// Reading from or writing to the object store failed.
    #[display("object store error")]
    Store,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store)
    }
}
