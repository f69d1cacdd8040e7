//! Object store trait and implementations.
//!
//! This module defines the `ObjectStore` trait, which provides a unified
//! interface for blob operations across different backends (local filesystem,
//! S3-compatible services, etc.).

mod local;
#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "s3")]
mod s3;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
use crate::error::{ErrorKind, Result};
use crate::models::ObjectInfo;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::pin::Pin;

type ObjectInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<ObjectInfo>> + Send + 'a>>;

/// Unified interface for object stores.
///
/// A deliberately small key-value blob interface: existence probes, whole
/// object puts and reads, deletes and listings. There is no append or partial
/// write, so a failed put can never corrupt an object that was previously
/// stored under the same key.
///
/// # Key Handling
/// All keys are relative to the store root and must be validated using
/// [`validate_key`](crate::validate_key) before use. Implementations enforce
/// this validation.
///
/// # Examples
///
/// ```
/// use vitrine_storage::{ObjectStore, error::Result};
///
/// async fn upload_once(store: &dyn ObjectStore, key: &str, data: Vec<u8>) -> Result<String> {
///     if store.exists(key).await? {
///         return Ok(store.public_url(key));
///     }
///     store.put(key, data, "image/jpeg").await
/// }
/// ```
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of the configured backend. Used for logging only.
    fn name(&self) -> &str;

    /// Public address that consumers use to fetch the object stored at `key`.
    ///
    /// This is a pure function of the key and does not check that the object
    /// exists.
    fn public_url(&self, key: &str) -> String;

    /// Check that the store is reachable and the configured credentials are
    /// accepted.
    ///
    /// Called once at startup so that authentication failures abort the run
    /// before any work is done. The default implementation does nothing.
    async fn verify(&self) -> Result<()> {
        Ok(())
    }

    /// Check if an object exists.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use vitrine_storage::{ObjectStore, error::Result};
    /// # async fn example(store: &dyn ObjectStore) -> Result<()> {
    /// if store.exists("metadata/latest.json").await? {
    ///     println!("A catalog has been published before");
    /// }
    /// # Ok(())
    /// # }
    /// ```
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Store an object, replacing anything already stored under `key`.
    ///
    /// Returns the object's public address (see [`public_url()`](Self::public_url)).
    ///
    /// # Notes
    /// - The write is a whole-object put: readers observe either the previous
    ///   object or the new one, never a mix.
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<String>;

    /// Store the contents of a local file under `key`, with the same
    /// semantics as [`put()`](Self::put).
    ///
    /// Backends that can stream from disk override this. The default
    /// implementation reads the whole file into memory first.
    async fn put_file(&self, key: &str, source: &Path, content_type: &str) -> Result<String> {
        let data = tokio::fs::read(source).await.map_err(ErrorKind::Io)?;
        self.put(key, data, content_type).await
    }

    /// Read an object's contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Delete an object.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Stream object metadata matching an optional prefix.
    ///
    /// Prefix matching is segment-based: a prefix of `thumbs` matches
    /// `thumbs/2024/01/a.jpg` but not `thumbsup.jpg`.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// # use vitrine_storage::{ObjectStore, error::Result};
    /// # async fn example(store: &dyn ObjectStore) -> Result<()> {
    /// let mut stream = store.list_stream(Some("originals"));
    /// while let Some(info) = stream.try_next().await? {
    ///     println!("{}: {} bytes", info.key, info.size);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, prefix: Option<&'a str>) -> ObjectInfoStream<'a>;

    /// List all objects matching an optional prefix.
    ///
    /// Default implementation of this method is to collect all the results
    /// from [`list_stream()`](Self::list_stream) into a [`Vec`] before
    /// returning.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectInfo>> {
        self.list_stream(prefix).try_collect().await
    }
}

/// Segment-based prefix match shared by the backends that filter listings
/// themselves.
pub(crate) fn matches_prefix(key: &str, prefix: Option<&str>) -> bool {
    match prefix {
        None => true,
        Some(prefix) => key == prefix || key.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/')),
    }
}
