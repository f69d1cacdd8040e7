//! S3-compatible object store.
//!
//! This module provides an object store implementation for S3-compatible
//! services including AWS S3, Backblaze B2, Tigris (Fly.io), Cloudflare R2
//! and others.
//!
//! # Credentials
//!
//! Credentials are provided explicitly via the configuration file (or the
//! environment, through the configuration layer). Each store specifies its
//! own `key_id` and `key_secret`.
//!
//! TODO: Support `credentials: "profile:name"` in config to use AWS SDK
//! credential providers (~/.aws/credentials) for actual AWS S3 targets.

use super::{ObjectInfoStream, matches_prefix};
use crate::ObjectStore;
use crate::error::{Error, ErrorKind, Result};
use crate::key::{join as join_key, validate as validate_key};
use crate::models::ObjectInfo;
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, http::HttpResponse, retry::RetryConfig},
    error::{DisplayErrorContext, SdkError},
    primitives::{ByteStream, DateTime},
};
use exn::{OptionExt, ResultExt};
use std::path::Path;
use std::sync::Arc;
use time::UtcDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;

/// S3-compatible object store.
///
/// Stores objects in an S3 bucket, optionally under a key prefix. All keys are
/// relative to the configured prefix (if any).
///
/// # Examples
///
/// ```no_run
/// use vitrine_storage::backend::S3Backend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = S3Backend::new(
///     "gallery",
///     "my-bucket",
///     Some("media/".to_string()),
///     "auto",
///     Some("https://account.r2.cloudflarestorage.com".to_string()),
///     Some("https://media.example.com".to_string()),
///     "access_key_id",
///     "secret_access_key",
/// ).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    region: String,
    endpoint: Option<String>,
    public_url: Option<String>,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 object store.
    ///
    /// # Arguments
    /// * `name` - A name for this store (used in logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix (acts as virtual directory)
    /// * `region` - AWS region or provider-specific region (e.g., "us-west-004" for Backblaze)
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `public_url` - Base URL objects are publicly served from (CDN, custom domain)
    /// * `key_id` - AWS/provider access key ID
    /// * `key_secret` - AWS/provider secret access key
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<String>,
        public_url: Option<String>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix.filter(|p| !p.trim_matches('/').is_empty()).map(validate_key).transpose()?;
        let name = name.into();
        let bucket = bucket.into();
        let region = region.into();
        let credentials = Credentials::new(key_id, key_secret, None, None, "vitrine-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.clone()))
            // Configure retry policy with exponential backoff (1 initial + 3 retries)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Use path-style addressing for better compatibility with
            // S3-compatible services (Backblaze, MinIO, etc.)
            .force_path_style(true);
        // Set custom endpoint for non-AWS services
        if let Some(endpoint_url) = &endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        let client = Client::from_conf(config_builder.build());
        let rate_limiter = Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS));
        Ok(Self {
            name,
            client,
            bucket,
            prefix,
            region,
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
            public_url: public_url.map(|u| u.trim_end_matches('/').to_string()),
            rate_limiter,
        })
    }

    /// Construct the full S3 key from a relative key.
    fn full_key(&self, key: &str) -> Result<String> {
        let validated = validate_key(key)?;
        Ok(join_key(self.prefix.as_deref(), &validated))
    }

    /// Strip the configured prefix from an S3 key to get the relative key.
    fn relative_key(&self, key: &str) -> Result<String> {
        let relative = match &self.prefix {
            Some(prefix) => key.strip_prefix(prefix.as_str()).and_then(|s| s.strip_prefix('/')).unwrap_or(key),
            None => key,
        };
        validate_key(relative)
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> OwnedSemaphorePermit {
        // unwrap is safe: semaphore is never closed
        self.rate_limiter.clone().acquire_owned().await.unwrap()
    }

    /// Convert AWS DateTime to UtcDateTime.
    fn parse_datetime(dt: &DateTime) -> Result<UtcDateTime> {
        UtcDateTime::from_unix_timestamp_nanos(dt.as_nanos())
            .or_raise(|| ErrorKind::BackendError("S3 datetime out of range".to_string()))
    }

    /// Classify an SDK error, keeping the original as the cause in the error
    /// tree.
    #[track_caller]
    fn sdk_error<E>(err: SdkError<E, HttpResponse>, key: &str) -> Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let status = err.raw_response().map(|response| response.status().as_u16());
        let message = DisplayErrorContext(&err).to_string();
        let kind = match (&err, status) {
            (_, Some(401 | 403)) => ErrorKind::PermissionDenied(key.to_string()),
            (SdkError::DispatchFailure(_) | SdkError::TimeoutError(_), _) => ErrorKind::Network(message),
            _ => ErrorKind::BackendError(message),
        };
        exn::Exn::from(err).raise(kind)
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn public_url(&self, key: &str) -> String {
        let full_key = join_key(self.prefix.as_deref(), key);
        match (&self.public_url, &self.endpoint) {
            (Some(base), _) => format!("{base}/{full_key}"),
            (None, Some(endpoint)) => format!("{endpoint}/{}/{full_key}", self.bucket),
            (None, None) => format!("https://{}.s3.{}.amazonaws.com/{full_key}", self.bucket, self.region),
        }
    }

    async fn verify(&self) -> Result<()> {
        let _permit = self.acquire_permit().await;
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, &self.bucket))?;
        tracing::debug!(store = self.name, bucket = self.bucket, "S3 bucket is reachable");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await;
        match self.client.head_object().bucket(&self.bucket).key(&full_key).send().await {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(e)) if e.err().is_not_found() => Ok(false),
            // Some S3-compatible services answer HEAD on a missing key with a
            // bare 404 the SDK can't model.
            Err(e) if e.raw_response().is_some_and(|r| r.status().as_u16() == 404) => Ok(false),
            Err(e) => Err(Self::sdk_error(e, &full_key)),
        }
    }

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<String> {
        let full_key = self.full_key(key)?;
        let size = data.len();
        let _permit = self.acquire_permit().await;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, &full_key))?;
        tracing::trace!(store = self.name, key = full_key, size, "Object uploaded");
        Ok(self.public_url(key))
    }

    /// Streams the file from disk instead of buffering it.
    ///
    /// TODO: Objects over 5 GiB need a multipart upload; a single PutObject
    /// is rejected above that size.
    async fn put_file(&self, key: &str, source: &Path, content_type: &str) -> Result<String> {
        let full_key = self.full_key(key)?;
        let body = ByteStream::from_path(source)
            .await
            .or_raise(|| ErrorKind::BackendError(format!("could not read {}", source.display())))?;
        let size = body.size_hint().1;
        let _permit = self.acquire_permit().await;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, &full_key))?;
        tracing::trace!(store = self.name, key = full_key, size, "Object uploaded from file");
        Ok(self.public_url(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await;
        let output = match self.client.get_object().bucket(&self.bucket).key(&full_key).send().await {
            Ok(output) => output,
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => {
                exn::bail!(ErrorKind::NotFound(key.to_string()))
            },
            Err(e) => return Err(Self::sdk_error(e, &full_key)),
        };
        let body = output.body.collect().await.or_raise(|| ErrorKind::Network(format!("reading body of {full_key}")))?;
        Ok(body.into_bytes().to_vec())
    }

    /// S3 does not report missing keys on delete, so unlike the other stores
    /// this never returns [`NotFound`](ErrorKind::NotFound).
    async fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, &full_key))?;
        Ok(())
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a str>) -> ObjectInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_key).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        // S3 prefixes are plain string prefixes; add the trailing separator
        // so listing "thumbs" doesn't also return "thumbsup.jpg".
        let list_prefix = match (&self.prefix, &validated_prefix) {
            (store, Some(pfx)) => Some(format!("{}/", join_key(store.as_deref(), pfx))),
            (Some(store), None) => Some(format!("{store}/")),
            (None, None) => None,
        };

        Box::pin(stream! {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(list_prefix)
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = match page {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(Self::sdk_error(e, &self.bucket));
                        break;
                    },
                };
                for object in page.contents() {
                    let Some(key) = object.key() else { continue };
                    let relative = match self.relative_key(key) {
                        Ok(relative) => relative,
                        Err(e) => { yield Err(e); continue; },
                    };
                    if !matches_prefix(&relative, validated_prefix.as_deref()) {
                        continue;
                    }
                    let modified = object
                        .last_modified()
                        .ok_or_raise(|| ErrorKind::BackendError(format!("no modification date for {key}")))
                        .and_then(Self::parse_datetime);
                    let modified = match modified {
                        Ok(modified) => modified,
                        Err(e) => { yield Err(e); continue; },
                    };
                    let size = u64::try_from(object.size().unwrap_or_default()).unwrap_or_default();
                    yield Ok(ObjectInfo::new(relative, size, modified));
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend(prefix: Option<&str>, endpoint: Option<&str>, public_url: Option<&str>) -> S3Backend {
        S3Backend::new(
            "test",
            "bucket",
            prefix.map(String::from),
            "us-west-004",
            endpoint.map(String::from),
            public_url.map(String::from),
            "key",
            "secret",
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_full_key_without_prefix() {
        let store = backend(None, None, None).await;
        assert_eq!(store.full_key("thumbs/2024/01/abc.jpg").unwrap(), "thumbs/2024/01/abc.jpg");
        assert!(store.full_key("../escape").is_err());
    }

    #[tokio::test]
    async fn test_full_key_with_prefix() {
        let store = backend(Some("gallery/"), None, None).await;
        assert_eq!(store.full_key("thumbs/2024/01/abc.jpg").unwrap(), "gallery/thumbs/2024/01/abc.jpg");
    }

    #[tokio::test]
    async fn test_relative_key() {
        let store = backend(Some("gallery"), None, None).await;
        assert_eq!(store.relative_key("gallery/metadata/latest.json").unwrap(), "metadata/latest.json");
        let bare = backend(None, None, None).await;
        assert_eq!(bare.relative_key("metadata/latest.json").unwrap(), "metadata/latest.json");
    }

    #[tokio::test]
    async fn test_public_url_aws() {
        let store = backend(None, None, None).await;
        assert_eq!(store.public_url("originals/a.jpg"), "https://bucket.s3.us-west-004.amazonaws.com/originals/a.jpg");
    }

    #[tokio::test]
    async fn test_public_url_custom_endpoint() {
        let store = backend(Some("media"), Some("https://s3.example.com/"), None).await;
        assert_eq!(store.public_url("originals/a.jpg"), "https://s3.example.com/bucket/media/originals/a.jpg");
    }

    #[tokio::test]
    async fn test_public_url_override() {
        let store = backend(Some("media"), Some("https://s3.example.com"), Some("https://cdn.example.com/")).await;
        assert_eq!(store.public_url("thumbs/a.jpg"), "https://cdn.example.com/media/thumbs/a.jpg");
    }
}
