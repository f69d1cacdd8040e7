//! Local filesystem object store.
//!
//! This module provides an object store implementation for a directory on the
//! local filesystem. Keys map directly onto relative paths under the root and
//! are accessed using `tokio::fs` for async I/O. Useful for previewing a
//! gallery locally, or for serving the store from any static file server.

use super::{ObjectInfoStream, matches_prefix};
use crate::error::{ErrorKind, Result};
use crate::key::validate as validate_key;
use crate::models::ObjectInfo;
use crate::ObjectStore;
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::create_dir_all as sync_create_dir;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    Object(ObjectInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem object store.
///
/// # Examples
///
/// ```no_run
/// use vitrine_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = LocalBackend::new("preview", "/srv/gallery", Some("https://gallery.example.com".to_string()))?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory for the store
    root: PathBuf,
    /// Base address objects are served from, if any. Falls back to `file://`
    /// URLs.
    public_url: Option<String>,
}
impl LocalBackend {
    /// Create a new local filesystem store.
    ///
    /// # Arguments
    /// * `root` - Absolute path to the store's root directory
    /// * `public_url` - Base URL the root directory is served from
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists but is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>, public_url: Option<String>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidKey(root.display().to_string()));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidKey(root.display().to_string()));
            }
        } else {
            // Use non-async here; it'll only happen once on startup and it's
            // not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root.display().to_string()))?;
        }
        let public_url = public_url.map(|url| url.trim_end_matches('/').to_string());
        Ok(Self { name: name.into(), root, public_url })
    }

    /// Get the absolute path for a key.
    ///
    /// Validates the key and joins it with the root directory.
    fn absolute_path(&self, key: &str) -> Result<PathBuf> {
        let validated = validate_key(key)?;
        Ok(self.root.join(validated))
    }

    /// Convert an absolute path back to a key.
    fn relative_key(&self, absolute: &Path) -> Result<String> {
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        let segments: Vec<&str> = relative
            .components()
            .map(|c| {
                c.as_os_str()
                    .to_str()
                    .ok_or_else(|| exn::Exn::from(ErrorKind::InvalidKey(relative.display().to_string())))
            })
            .collect::<Result<_>>()?;
        validate_key(segments.join("/"))
    }

    fn map_io_error(e: std::io::Error, key: &str) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(key.to_string()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(key.to_string()),
            _ => ErrorKind::Io(e),
        }
    }

    async fn process_entry(&self, entry: DirEntry, prefix: Option<&str>) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path.display().to_string()))?;
        if metadata.is_dir() {
            return Ok(WalkEntry::Descend(path));
        }
        // In-flight temporary files from a concurrent put are not objects yet.
        if !metadata.is_file() || Self::is_partial(&path) {
            return Ok(WalkEntry::Skip);
        }
        let key = self.relative_key(&path)?;
        if !matches_prefix(&key, prefix) {
            return Ok(WalkEntry::Skip);
        }
        let modified = metadata.modified().map_err(ErrorKind::Io)?;
        Ok(WalkEntry::Object(ObjectInfo::new(key, metadata.len(), modified)))
    }

    /// Write an object next to its destination and rename it into place, so
    /// readers never observe a half-written object. Returns the validated key.
    async fn write_atomically<F>(&self, key: &str, write: F) -> Result<String>
    where
        F: FnOnce(&mut std::fs::File) -> std::io::Result<()> + Send + 'static,
    {
        let key = validate_key(key)?;
        let abs_path = self.root.join(&key);
        let parent = abs_path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        // Create parent directories if needed, to keep behaviour
        // consistent with S3-compatible storage.
        fs::create_dir_all(&parent).await.map_err(|e| Self::map_io_error(e, &key))?;
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::Builder::new().prefix(PARTIAL_PREFIX).tempfile_in(&parent)?;
            write(tmp.as_file_mut())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&abs_path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .or_raise(|| ErrorKind::BackendError("local write task panicked".to_string()))?
        .map_err(|e| Self::map_io_error(e, &key))?;
        Ok(key)
    }

    fn is_partial(path: &Path) -> bool {
        path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with(PARTIAL_PREFIX))
    }
}

const PARTIAL_PREFIX: &str = ".vitrine-partial-";

#[async_trait]
impl ObjectStore for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn public_url(&self, key: &str) -> String {
        match &self.public_url {
            Some(base) => format!("{base}/{key}"),
            None => format!("file://{}", self.root.join(key).display()),
        }
    }

    async fn verify(&self) -> Result<()> {
        let metadata = fs::metadata(&self.root)
            .await
            .map_err(|e| Self::map_io_error(e, &self.root.display().to_string()))?;
        if metadata.permissions().readonly() {
            exn::bail!(ErrorKind::PermissionDenied(self.root.display().to_string()));
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let abs_path = self.absolute_path(key)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn put(&self, key: &str, data: Vec<u8>, _content_type: &str) -> Result<String> {
        let key = self.write_atomically(key, move |tmp| tmp.write_all(&data)).await?;
        Ok(self.public_url(&key))
    }

    async fn put_file(&self, key: &str, source: &Path, _content_type: &str) -> Result<String> {
        // Opened up front so a missing source isn't reported as a missing key.
        let mut reader = fs::File::open(source).await.map_err(ErrorKind::Io)?.into_std().await;
        let key = self.write_atomically(key, move |tmp| std::io::copy(&mut reader, tmp).map(drop)).await?;
        Ok(self.public_url(&key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(key)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, key))?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let abs_path = self.absolute_path(key)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| Self::map_io_error(e, key))?)
    }

    // Did I mention that async streams are really hard?!
    fn list_stream<'a>(&'a self, prefix: Option<&'a str>) -> ObjectInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_key).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        // Walk from the prefix directory itself when it exists; otherwise
        // fall back to the root and let the prefix filter do the work.
        let start_dir = validated_prefix
            .as_ref()
            .map(|prefix| self.root.join(prefix))
            .filter(|dir| dir.is_dir())
            .unwrap_or_else(|| self.root.clone());
        let mut stack = vec![start_dir];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // To stay consistent with the behaviour of S3-compatible
                    // backends, asking for the contents of a directory that
                    // doesn't exist results in an empty list not an error.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current.display().to_string())));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => {
                            yield Err(exn::Exn::from(Self::map_io_error(e, &current.display().to_string())));
                            continue 'entries;
                        },
                    };
                    match self.process_entry(entry, validated_prefix.as_deref()).await {
                        Ok(WalkEntry::Object(info)) => yield Ok(info),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }
}
