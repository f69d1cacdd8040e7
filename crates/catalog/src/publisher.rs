//! Versioned catalog publishing.
//!
//! Every run writes an immutable, timestamped snapshot and then overwrites
//! the mutable `latest` pointer with the same bytes. The timestamped copy is
//! always written first: if anything fails part-way, the previous `latest`
//! is left untouched.

use crate::error::{ErrorKind, Result};
use crate::model::Snapshot;
use exn::ResultExt;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use vitrine_storage::StoreHandle;
use vitrine_storage::error::ErrorKind as StorageErrorKind;

pub const METADATA_PREFIX: &str = "metadata";
pub const LATEST_KEY: &str = "metadata/latest.json";
const CONTENT_TYPE: &str = "application/json";
/// ISO-8601 with `-` in place of `:`, which not every backend accepts in keys.
const SNAPSHOT_FORMAT: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day]T[hour]-[minute]-[second].[subsecond digits:3]Z");

/// Key of the immutable snapshot generated at `generated_at`.
///
/// ```
/// use time::macros::datetime;
/// use vitrine_catalog::snapshot_key;
///
/// let key = snapshot_key(datetime!(2024-05-01 14:30:00.5 +02:00)).unwrap();
/// assert_eq!(key, "metadata/2024-05-01T12-30-00.500Z.json");
/// ```
pub fn snapshot_key(generated_at: OffsetDateTime) -> Result<String> {
    let stamp = generated_at.to_offset(UtcOffset::UTC).format(SNAPSHOT_FORMAT).or_raise(|| ErrorKind::Serialize)?;
    Ok(format!("{METADATA_PREFIX}/{stamp}.json"))
}

/// Where a snapshot was published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub key: String,
    pub url: String,
    pub latest_url: String,
}

pub struct Publisher {
    store: StoreHandle,
}
impl Publisher {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip_all, fields(store = self.store.name()))]
    pub async fn publish(&self, snapshot: &Snapshot) -> Result<Published> {
        let key = snapshot_key(snapshot.generated_at)?;
        let body = serde_json::to_vec_pretty(snapshot).or_raise(|| ErrorKind::Serialize)?;
        if self.store.exists(&key).await.or_raise(|| ErrorKind::Store)? {
            exn::bail!(ErrorKind::SnapshotExists(key));
        }
        let url = self.store.put(&key, body.clone(), CONTENT_TYPE).await.or_raise(|| ErrorKind::Store)?;
        tracing::debug!(%key, bytes = body.len(), "Snapshot written");
        let latest_url = self.store.put(LATEST_KEY, body, CONTENT_TYPE).await.or_raise(|| ErrorKind::Store)?;
        tracing::info!(%key, records = snapshot.catalog.len(), "Catalog published");
        Ok(Published { key, url, latest_url })
    }

    /// The most recently published snapshot, or `None` if nothing has been
    /// published to this store yet.
    pub async fn latest(&self) -> Result<Option<Snapshot>> {
        let body = match self.store.get(LATEST_KEY).await {
            Ok(body) => body,
            Err(err) if matches!(&*err, StorageErrorKind::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err).or_raise(|| ErrorKind::Store),
        };
        let snapshot = serde_json::from_slice(&body).or_raise(|| ErrorKind::Corrupt(LATEST_KEY.to_string()))?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RootCatalog;
    use crate::model::tests::image_record;
    use std::sync::Arc;
    use time::macros::datetime;
    use vitrine_storage::ObjectStore;
    use vitrine_storage::backend::MockBackend;

    fn snapshot(at: OffsetDateTime) -> Snapshot {
        let mut catalog = RootCatalog::default();
        let section = catalog.sections.entry("trip".into()).or_default();
        section.images.insert("2024-05-01-093000-001.jpg".into(), image_record('a'));
        Snapshot { generated_at: at, catalog }
    }

    #[tokio::test]
    async fn test_publish_writes_snapshot_then_latest() {
        let store = Arc::new(MockBackend::default());
        let publisher = Publisher::new(store.clone());
        assert_eq!(publisher.latest().await.unwrap(), None);

        let first = snapshot(datetime!(2024-05-01 10:00:00 UTC));
        let published = publisher.publish(&first).await.unwrap();
        assert_eq!(published.key, "metadata/2024-05-01T10-00-00.000Z.json");
        assert_eq!(published.latest_url, "mock://mock/metadata/latest.json");
        assert_eq!(store.get(&published.key).await.unwrap(), store.get(LATEST_KEY).await.unwrap());
        assert_eq!(store.content_type_of(LATEST_KEY).await.as_deref(), Some("application/json"));
        assert_eq!(publisher.latest().await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_snapshots_are_never_overwritten() {
        let store = Arc::new(MockBackend::default());
        let publisher = Publisher::new(store.clone());
        let at = datetime!(2024-05-01 10:00:00 UTC);
        publisher.publish(&snapshot(at)).await.unwrap();

        let mut changed = snapshot(at);
        changed.catalog.sections.clear();
        let err = publisher.publish(&changed).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::SnapshotExists(_)));
        assert_eq!(publisher.latest().await.unwrap().unwrap().catalog.len(), 1);
        assert_eq!(store.put_count(LATEST_KEY).await, 1);
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_previous_latest() {
        let previous = serde_json::to_vec(&snapshot(datetime!(2024-04-01 08:00:00 UTC))).unwrap();
        let store =
            Arc::new(MockBackend::with_objects([(LATEST_KEY, previous.clone())]).failing_puts_under("metadata/"));
        let publisher = Publisher::new(store.clone());

        let err = publisher.publish(&snapshot(datetime!(2024-05-01 10:00:00 UTC))).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Store));
        assert_eq!(store.get(LATEST_KEY).await.unwrap(), previous);
    }

    #[tokio::test]
    async fn test_latest_failure_after_snapshot_keeps_previous_latest() {
        let previous = serde_json::to_vec(&snapshot(datetime!(2024-04-01 08:00:00 UTC))).unwrap();
        let store =
            Arc::new(MockBackend::with_objects([(LATEST_KEY, previous.clone())]).failing_puts_under(LATEST_KEY));
        let publisher = Publisher::new(store.clone());

        assert!(publisher.publish(&snapshot(datetime!(2024-05-01 10:00:00 UTC))).await.is_err());
        assert!(store.exists("metadata/2024-05-01T10-00-00.000Z.json").await.unwrap());
        assert_eq!(store.get(LATEST_KEY).await.unwrap(), previous);
    }

    #[tokio::test]
    async fn test_corrupt_latest() {
        let store = Arc::new(MockBackend::with_objects([(LATEST_KEY, b"{ not json".to_vec())]));
        let err = Publisher::new(store).latest().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Corrupt(_)));
    }
}
