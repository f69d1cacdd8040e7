//! Media Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A media error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// Every one of these is scoped to a single source file; none of them should
/// stop other files from being processed.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A required external program is not installed (or not on `PATH`).
    #[display("{_0} not detected on your system")]
    ToolNotFound(#[error(not(source))] &'static str),
    /// An external program exited unsuccessfully.
    #[display("{tool} exited with code {code:?}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    /// The file's dimensions could not be determined.
    #[display("could not determine media dimensions")]
    Probe,
    /// The file could not be decoded by the image codec.
    #[display("could not decode image")]
    Decode,
    /// A derivative could not be encoded.
    #[display("could not encode derivative")]
    Encode,
    /// The file is not a supported image or video.
    #[display("unsupported media: {_0}")]
    Unsupported(#[error(not(source))] String),
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io)
    }
}
