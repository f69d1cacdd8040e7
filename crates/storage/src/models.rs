//! Storage models.

use time::UtcDateTime;

/// Object metadata returned by store listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Key relative to the store root (after any configured prefix)
    pub key: String,
    /// Object size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: UtcDateTime,
}
impl ObjectInfo {
    pub fn new(key: impl Into<String>, size: u64, modified: impl Into<UtcDateTime>) -> Self {
        Self {
            key: key.into(),
            size,
            modified: modified.into(),
        }
    }
}

/// MIME type for an object, derived from the extension of its key.
///
/// Unknown extensions are served as `application/octet-stream`.
pub fn content_type(key: &str) -> &'static str {
    let extension = key.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("tif" | "tiff") => "image/tiff",
        Some("bmp") => "image/bmp",
        Some("heic") => "image/heic",
        Some("mp4" | "m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        Some("mkv") => "video/x-matroska",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
