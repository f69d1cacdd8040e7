//! Pipeline Error Types
//!
//! Two separate error types mirror the two ways a run can go wrong:
//! - [`Error`] (with [`ErrorKind`]) is structural. It aborts the run and
//!   nothing is published.
//! - [`ItemError`] (with [`ItemErrorKind`]) is scoped to one source file. It
//!   is recorded in the [`RunReport`](crate::RunReport) and never escalates.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A structural pipeline error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for run-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A per-file error with automatic location tracking.
pub type ItemError = exn::Exn<ItemErrorKind>;
/// Result type alias for per-file operations.
pub type ItemResult<T> = std::result::Result<T, ItemError>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The source root is missing or is not a directory.
    #[display("source root {} is not a readable directory", _0.display())]
    SourceRoot(#[error(not(source))] PathBuf),
    /// A directory below the source root could not be read.
    #[display("could not read source directory {}", _0.display())]
    Walk(#[error(not(source))] PathBuf),
    /// Temporary working storage could not be created.
    #[display("could not create temporary working storage")]
    Workspace,
    /// The catalog could not be published.
    #[display("could not publish catalog")]
    Publish,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Publish)
    }
}

/// Which step of a file's processing failed.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    #[display("hashing")]
    Hash,
    #[display("probing")]
    Probe,
    #[display("derivative generation")]
    Derivative,
    #[display("upload")]
    Upload,
}

/// A single file failed; `reason` carries the cause's message so it can be
/// reported without walking the error tree.
#[derive(Debug, Display, Error)]
#[display("{stage} failed: {reason}")]
pub struct ItemErrorKind {
    #[error(not(source))]
    pub stage: Stage,
    #[error(not(source))]
    pub reason: String,
}

/// Raise a lower-level error into an [`ItemError`] for `stage`.
///
/// ```ignore
/// store.exists(key).await.map_err(item(Stage::Upload))?;
/// ```
pub(crate) fn item<E>(stage: Stage) -> impl FnOnce(exn::Exn<E>) -> ItemError
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |err| {
        let reason = (*err).to_string();
        err.raise(ItemErrorKind { stage, reason })
    }
}

/// Like [`item()`], for plain `std::io::Error`s.
pub(crate) fn item_io(stage: Stage) -> impl FnOnce(std::io::Error) -> ItemError {
    move |err| item(stage)(exn::Exn::from(err))
}
