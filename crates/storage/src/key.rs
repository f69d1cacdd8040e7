//! Object key validation.
//!
//! Keys are `/`-separated strings relative to the store root. Every backend
//! runs keys through [`validate`] before touching the network or disk, so a
//! key can never address anything outside of the configured bucket prefix or
//! root directory.

use crate::error::{ErrorKind, Result};

/// Validates an object key for security and correctness.
/// Ensures that keys don't escape the store root (no `..` traversal).
///
/// > **Note:** Backslashes are rejected outright rather than normalized; they
/// >           are never produced by this crate and mean different things to
/// >           different backends.
///
/// # Returns
/// Returns the normalized key if valid, or [`InvalidKey`](crate::error::ErrorKind::InvalidKey)
/// if invalid.
///
/// # Examples
///
/// ```
/// use vitrine_storage::validate_key;
/// // Valid keys
/// assert!(validate_key("originals/2024/03/abc.jpg").is_ok());
/// assert!(validate_key("metadata/latest.json").is_ok());
/// assert!(validate_key("a/../metadata/latest.json").is_ok()); // (never leaves store root)
/// // Invalid keys
/// assert!(validate_key("../etc/passwd").is_err());
/// assert!(validate_key("a/../../b").is_err());
/// assert!(validate_key("a\0b").is_err());
/// // Keys get resolved
/// assert_eq!(validate_key("wrong/../thumbs//./2024/01/x.jpg/").unwrap(), "thumbs/2024/01/x.jpg");
/// ```
pub fn validate(key: impl AsRef<str>) -> Result<String> {
    let raw = key.as_ref();
    if raw.contains('\0') || raw.contains('\\') {
        exn::bail!(ErrorKind::InvalidKey(raw.to_string()));
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {},
            ".." => {
                if segments.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidKey(raw.to_string()));
                }
            },
            normal => segments.push(normal),
        }
    }
    match segments.is_empty() {
        true => exn::bail!(ErrorKind::InvalidKey(raw.to_string())),
        false => Ok(segments.join("/")),
    }
}

/// Joins an optional prefix onto a validated key.
pub fn join(prefix: Option<&str>, key: &str) -> String {
    match prefix.map(|p| p.trim_end_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}/{key}"),
        None => key.to_string(),
    }
}
