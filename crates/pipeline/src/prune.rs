//! Removal of blobs the current catalog no longer references.

use crate::upload::Role;
use futures::TryStreamExt;
use std::collections::BTreeSet;
use vitrine_storage::ObjectStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneSummary {
    pub deleted: u64,
    pub failed: u64,
}

/// Delete every blob under the role prefixes that isn't in `referenced`.
///
/// Catalog snapshots live outside the role prefixes and are never touched.
/// Failures are logged and counted; pruning carries on with the next key.
#[tracing::instrument(skip_all, fields(store = store.name(), referenced = referenced.len()))]
pub async fn prune(store: &dyn ObjectStore, referenced: &BTreeSet<String>) -> PruneSummary {
    let mut summary = PruneSummary::default();
    for role in Role::ALL {
        let stale: Vec<String> = match store.list_stream(Some(role.prefix())).try_collect::<Vec<_>>().await {
            Ok(objects) => objects.into_iter().map(|info| info.key).filter(|key| !referenced.contains(key)).collect(),
            Err(err) => {
                tracing::warn!(prefix = role.prefix(), error = ?err, "Could not list blobs to prune");
                summary.failed += 1;
                continue;
            },
        };
        for key in stale {
            match store.delete(&key).await {
                Ok(()) => {
                    tracing::debug!(%key, "Pruned");
                    summary.deleted += 1;
                },
                Err(err) => {
                    tracing::warn!(%key, error = ?err, "Could not prune blob");
                    summary.failed += 1;
                },
            }
        }
    }
    tracing::info!(deleted = summary.deleted, failed = summary.failed, "Prune complete");
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitrine_storage::backend::MockBackend;

    #[tokio::test]
    async fn test_only_unreferenced_blobs_are_deleted() {
        let store = MockBackend::with_objects([
            ("originals/2023/07/keep.jpg", b"a".to_vec()),
            ("originals/2023/07/stale.jpg", b"b".to_vec()),
            ("thumbs/2023/07/keep.jpg", b"c".to_vec()),
            ("previews/2022/01/stale.mp4", b"d".to_vec()),
            ("metadata/latest.json", b"{}".to_vec()),
            ("metadata/2023-07-14T09-05-03.000Z.json", b"{}".to_vec()),
        ]);
        let referenced: BTreeSet<String> =
            ["originals/2023/07/keep.jpg", "thumbs/2023/07/keep.jpg"].into_iter().map(String::from).collect();

        let summary = prune(&store, &referenced).await;
        assert_eq!(summary, PruneSummary { deleted: 2, failed: 0 });
        let mut remaining: Vec<_> = store.list(None).await.unwrap().into_iter().map(|info| info.key).collect();
        remaining.sort();
        assert_eq!(
            remaining,
            [
                "metadata/2023-07-14T09-05-03.000Z.json",
                "metadata/latest.json",
                "originals/2023/07/keep.jpg",
                "thumbs/2023/07/keep.jpg",
            ]
        );
    }
}
