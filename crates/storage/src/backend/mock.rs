//! In-memory object store for testing.

use super::{ObjectInfoStream, matches_prefix};
use crate::ObjectStore;
use crate::error::{ErrorKind, Result};
use crate::key::validate as validate_key;
use crate::models::ObjectInfo;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::HashMap;
use time::UtcDateTime;
use tokio::sync::RwLock;

struct StoredObject {
    inserted: UtcDateTime,
    content_type: String,
    data: Vec<u8>,
}

#[derive(Default)]
struct State {
    objects: HashMap<String, StoredObject>,
    /// Number of successful puts per key, including overwrites.
    puts: HashMap<String, usize>,
}

/// In-memory object store for testing.
///
/// Objects are stored in a `HashMap` behind a [`RwLock`], so all trait
/// methods can operate on `&self` without external synchronisation. Every
/// successful [`put()`](ObjectStore::put) is counted per key, which lets tests
/// assert how many times a blob was actually transferred.
///
/// # Examples
///
/// ```
/// use vitrine_storage::{ObjectStore, backend::MockBackend};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MockBackend::with_objects([
///     ("originals/2024/01/abc.jpg", b"jpeg bytes"),
/// ]);
/// assert!(store.exists("originals/2024/01/abc.jpg").await?);
///
/// store.put("thumbs/2024/01/abc.jpg", b"thumb".to_vec(), "image/jpeg").await?;
/// assert_eq!(store.put_count("thumbs/2024/01/abc.jpg").await, 1);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    state: RwLock<State>,
    /// Puts to keys starting with this prefix fail with a network error.
    failing_prefix: Option<String>,
}

impl MockBackend {
    /// Create a mock store pre-populated with objects.
    ///
    /// Panics if any key fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass. Pre-populated objects do
    /// not count towards [`put_count()`](Self::put_count).
    pub fn with_objects(objects: impl IntoIterator<Item = (impl Into<String>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        let now = UtcDateTime::now();
        for (key, data) in objects {
            let key = key.into();
            let Ok(validated) = validate_key(&key) else {
                // The panic here is DELIBERATE. MockBackend is intended to be
                // used in tests; panics are expected. There is no error result.
                panic!("MockBackend::with_objects: invalid key {key}");
            };
            let content_type = crate::content_type(&validated).to_string();
            map.insert(validated, StoredObject { inserted: now, content_type, data: data.into() });
        }
        Self {
            name: "mock".to_string(),
            state: RwLock::new(State { objects: map, puts: HashMap::new() }),
            failing_prefix: None,
        }
    }

    /// Change the name of the mock store.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Make every put to a key under `prefix` fail, simulating a transport
    /// error part-way through a run.
    pub fn failing_puts_under(mut self, prefix: impl Into<String>) -> Self {
        self.failing_prefix = Some(prefix.into());
        self
    }

    /// How many times `key` has been successfully written.
    pub async fn put_count(&self, key: &str) -> usize {
        self.state.read().await.puts.get(key).copied().unwrap_or(0)
    }

    /// Total number of successful writes across all keys.
    pub async fn total_puts(&self) -> usize {
        self.state.read().await.puts.values().sum()
    }

    /// Content type recorded for `key`, if it exists.
    pub async fn content_type_of(&self, key: &str) -> Option<String> {
        self.state.read().await.objects.get(key).map(|object| object.content_type.clone())
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let objects: [(&str, &str); 0] = [];
        Self::with_objects(objects)
    }
}

#[async_trait]
impl ObjectStore for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn public_url(&self, key: &str) -> String {
        format!("mock://{}/{}", self.name, key)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = validate_key(key)?;
        Ok(self.state.read().await.objects.contains_key(&key))
    }

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<String> {
        let key = validate_key(key)?;
        if let Some(prefix) = &self.failing_prefix
            && key.starts_with(prefix.as_str())
        {
            exn::bail!(ErrorKind::Network(format!("simulated failure writing {key}")));
        }
        let mut guard = self.state.write().await;
        let object = StoredObject {
            inserted: UtcDateTime::now(),
            content_type: content_type.to_string(),
            data,
        };
        guard.objects.insert(key.clone(), object);
        *guard.puts.entry(key.clone()).or_default() += 1;
        Ok(self.public_url(&key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let key = validate_key(key)?;
        let guard = self.state.read().await;
        let object = guard.objects.get(&key).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(key.clone())))?;
        Ok(object.data.clone())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = validate_key(key)?;
        self.state
            .write()
            .await
            .objects
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(key)))
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a str>) -> ObjectInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_key).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            // Snapshot matching entries under the read lock, then drop it
            // before yielding to avoid holding the lock across yield points.
            let entries: Vec<ObjectInfo> = {
                let guard = self.state.read().await;
                guard
                    .objects
                    .iter()
                    .filter(|(key, _)| matches_prefix(key, validated_prefix.as_deref()))
                    .map(|(key, object)| ObjectInfo::new(key.clone(), object.data.len() as u64, object.inserted))
                    .collect()
            };
            for info in entries {
                yield Ok(info);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MockBackend::default();
        let url = store.put("test.json", b"hello".to_vec(), "application/json").await.unwrap();
        assert_eq!(url, "mock://mock/test.json");
        assert_eq!(store.get("test.json").await.unwrap(), b"hello");
        assert_eq!(store.content_type_of("test.json").await.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_with_objects() {
        let store = MockBackend::with_objects([
            ("originals/2024/01/a.jpg", Vec::from(*b"a")),
            ("thumbs/2024/01/a.jpg", Vec::from(*b"b")),
        ]);
        assert!(store.exists("originals/2024/01/a.jpg").await.unwrap());
        assert!(store.exists("thumbs/2024/01/a.jpg").await.unwrap());
        assert!(!store.exists("previews/2024/01/a.mp4").await.unwrap());
        assert_eq!(store.total_puts().await, 0);
    }

    #[tokio::test]
    async fn test_put_counts_overwrites() {
        let store = MockBackend::default();
        store.put("metadata/latest.json", b"1".to_vec(), "application/json").await.unwrap();
        store.put("metadata/latest.json", b"2".to_vec(), "application/json").await.unwrap();
        assert_eq!(store.put_count("metadata/latest.json").await, 2);
        assert_eq!(store.get("metadata/latest.json").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_failing_prefix() {
        let store = MockBackend::default().failing_puts_under("metadata/");
        let err = store.put("metadata/latest.json", b"{}".to_vec(), "application/json").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Network(_)));
        assert!(!store.exists("metadata/latest.json").await.unwrap());
        // Other prefixes are unaffected
        store.put("thumbs/a.jpg", b"x".to_vec(), "image/jpeg").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let store = MockBackend::default();
        let err = store.get("missing.json").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MockBackend::default();
        store.put("file.jpg", b"data".to_vec(), "image/jpeg").await.unwrap();
        store.delete("file.jpg").await.unwrap();
        assert!(!store.exists("file.jpg").await.unwrap());
        // Delete nonexistent -> NotFound
        let err = store.delete("file.jpg").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let store = MockBackend::with_objects([
            ("thumbs/2024/01/a.jpg", Vec::from(*b"a")),
            ("thumbs/2024/02/b.jpg", Vec::from(*b"b")),
            ("thumbsup.jpg", Vec::from(*b"c")),
            ("originals/2024/01/a.jpg", Vec::from(*b"d")),
        ]);
        let objects = store.list(Some("thumbs")).await.unwrap();
        assert_eq!(objects.len(), 2);
        let keys: Vec<_> = objects.iter().map(|o| o.key.as_str()).collect();
        assert!(keys.contains(&"thumbs/2024/01/a.jpg"));
        assert!(keys.contains(&"thumbs/2024/02/b.jpg"));
        assert_eq!(store.list(None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_key_traversal_rejected() {
        let store = MockBackend::default();
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.put("../escape", b"bad".to_vec(), "text/plain").await.is_err());
    }

    #[test]
    #[should_panic(expected = "invalid key")]
    fn test_with_objects_panics_on_bad_key() {
        MockBackend::with_objects([("../escape", Vec::from(*b"bad"))]);
    }
}
