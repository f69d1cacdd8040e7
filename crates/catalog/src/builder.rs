//! In-run catalog accumulation with cross-section deduplication.

use crate::model::{ContentHash, MediaRecord, RootCatalog};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;

/// How a file ended up in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// First time this content was seen in the run: the record was produced
    /// by this call.
    New,
    /// Content already recorded elsewhere in the run; the existing record was
    /// listed again under the new name.
    Reference,
}

#[derive(Default)]
struct State {
    catalog: RootCatalog,
    by_hash: HashMap<ContentHash, Arc<OnceCell<MediaRecord>>>,
}

/// Accumulates the [`RootCatalog`] for one run.
///
/// Shared by reference between concurrent workers. Each distinct content hash
/// gets a single slot; whichever worker reaches an empty slot first produces
/// the record while any other worker with the same content waits for it, so
/// derivatives and uploads happen at most once per hash. If producing fails
/// the slot stays empty and the next worker with that content tries again.
#[derive(Default)]
pub struct CatalogBuilder {
    state: Mutex<State>,
}
impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Nothing panics while holding the lock, but a poisoned catalog is
        // still a consistent catalog.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lists content under `section`/`name`, producing the record only if no
    /// record with `hash` exists anywhere in the run yet.
    ///
    /// A referenced record is reused verbatim, derivative URLs included.
    pub async fn record_or_reference<F, Fut, E>(
        &self,
        section: &str,
        name: &str,
        hash: &ContentHash,
        produce: F,
    ) -> Result<Recorded, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MediaRecord, E>>,
    {
        let slot = Arc::clone(self.lock().by_hash.entry(hash.clone()).or_default());
        let mut produced = false;
        let record = slot
            .get_or_try_init(|| {
                produced = true;
                produce()
            })
            .await?
            .clone();
        let mut state = self.lock();
        state.catalog.sections.entry(section.to_string()).or_default().images.insert(name.to_string(), record);
        Ok(match produced {
            true => Recorded::New,
            false => Recorded::Reference,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_catalog(self) -> RootCatalog {
        self.state.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()).catalog
    }
}
