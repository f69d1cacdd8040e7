//! Idempotent, content-addressed uploads.
//!
//! Blob keys are `<role>/<YYYY>/<MM>/<hash>.<ext>`: a pure function of the
//! content, so a blob that already exists never needs to be written again.

use crate::error::{ItemResult, Stage, item};
use crate::naming::StandardName;
use std::path::{Path, PathBuf};
use vitrine_catalog::ContentHash;
use vitrine_storage::{StoreHandle, content_type};

/// What a blob is, which decides the top-level key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Original,
    Thumb,
    Preview,
}
impl Role {
    pub const ALL: [Role; 3] = [Role::Original, Role::Thumb, Role::Preview];

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Original => "originals",
            Self::Thumb => "thumbs",
            Self::Preview => "previews",
        }
    }
}

/// Storage key for a blob.
///
/// ```ignore
/// blob_key(Role::Thumb, &name, &hash, "jpg") // "thumbs/2023/07/9f86….jpg"
/// ```
pub fn blob_key(role: Role, name: &StandardName, hash: &ContentHash, extension: &str) -> String {
    format!("{}/{}/{hash}.{extension}", role.prefix(), name.partition())
}

/// Outcome of making sure a blob is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upload {
    /// Already stored; nothing was transferred.
    Existing(String),
    Uploaded(String),
    /// Would have been uploaded, but this is a dry run.
    Planned(String),
}
impl Upload {
    pub fn into_url(self) -> String {
        match self {
            Self::Existing(url) | Self::Uploaded(url) | Self::Planned(url) => url,
        }
    }

    /// Whether bytes were (or, in a dry run, would have been) transferred.
    pub fn transferred(&self) -> bool {
        !matches!(self, Self::Existing(_))
    }
}

/// A derivative's state before upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derived {
    /// Already in the store, so it was never generated.
    Stored,
    /// Generated into a scratch file.
    Built(PathBuf),
    /// Missing from the store but not generated (dry run).
    Skipped,
}

pub struct Uploader {
    store: StoreHandle,
    dry_run: bool,
}
impl Uploader {
    pub fn new(store: StoreHandle, dry_run: bool) -> Self {
        Self { store, dry_run }
    }

    pub fn public_url(&self, key: &str) -> String {
        self.store.public_url(key)
    }

    pub async fn exists(&self, key: &str) -> ItemResult<bool> {
        self.store.exists(key).await.map_err(item(Stage::Upload))
    }

    /// Upload `source` under `key` unless an object already exists there.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn ensure_uploaded(&self, key: &str, source: &Path) -> ItemResult<Upload> {
        if self.exists(key).await? {
            tracing::trace!("Blob already stored");
            return Ok(Upload::Existing(self.public_url(key)));
        }
        self.put_file(key, source).await
    }

    /// Upload `source` under `key` without probing first. Used when the
    /// caller has already established that the blob is missing.
    pub async fn put_file(&self, key: &str, source: &Path) -> ItemResult<Upload> {
        if self.dry_run {
            return Ok(Upload::Planned(self.public_url(key)));
        }
        let url = self.store.put_file(key, source, content_type(key)).await.map_err(item(Stage::Upload))?;
        tracing::debug!(key, source = %source.display(), "Blob uploaded");
        Ok(Upload::Uploaded(url))
    }

    /// Store a derivative whose existence was already probed.
    pub async fn settle(&self, key: &str, derived: Derived) -> ItemResult<Upload> {
        match derived {
            Derived::Stored => Ok(Upload::Existing(self.public_url(key))),
            Derived::Skipped => Ok(Upload::Planned(self.public_url(key))),
            Derived::Built(path) => self.put_file(key, &path).await,
        }
    }
}
