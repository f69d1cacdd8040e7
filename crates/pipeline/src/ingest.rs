//! The ingestion run.
//!
//! Per file: `Discovered → Hashed → Duplicate → Referenced`, or
//! `Discovered → Hashed → DerivativesBuilt → Uploaded → Recorded`. Any step
//! can end in `Failed` instead, which only affects that file.
//!
//! Each file is inspected exactly once, while hashing. The resulting
//! [`MediaInfo`] drives its capture date, thumbnail and catalog record.

use crate::error::{ErrorKind, ItemResult, Result, Stage, item, item_io};
use crate::hash::hash_file;
use crate::naming::{NameAllocator, StandardName};
use crate::prune::{self, PruneSummary};
use crate::report::{ItemFailure, RunReport};
use crate::upload::{Derived, Role, Uploader, blob_key};
use crate::walk::{self, SourceFile};
use async_stream::stream;
use exn::ResultExt;
use futures::{Stream, StreamExt, stream};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::num::NonZero;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use vitrine_catalog::{
    CatalogBuilder, ContentHash, ImageUrls, Media, MediaRecord, Published, Publisher, Recorded, Snapshot, VideoUrls,
};
use vitrine_media::{
    CaptureDate, CaptureDates, DerivativeGenerator, MediaInfo, MediaKind, PREVIEW_EXTENSION, THUMBNAIL_EXTENSION,
};
use vitrine_storage::StoreHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Maximum number of files worked on at once.
    pub concurrency: usize,
    /// Hash, name and deduplicate, but generate, upload and publish nothing.
    pub dry_run: bool,
    /// Delete blobs the new catalog doesn't reference, after publishing.
    pub prune: bool,
    /// Directory to create the run's temporary working storage in, instead
    /// of the system temporary directory.
    pub temp_root: Option<PathBuf>,
}
impl Default for Options {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism().map(NonZero::get).unwrap_or(4),
            dry_run: false,
            prune: false,
            temp_root: None,
        }
    }
}

/// How a processed file ended up in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// New content; this many blobs were transferred.
    Uploaded { blobs: u64 },
    /// New content, but every blob was already stored.
    Existing,
    /// Same content as another file in this run.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub path: PathBuf,
    pub section: String,
    pub name: String,
    pub hash: ContentHash,
    pub status: Status,
}

/// Progress events emitted by [`Pipeline::ingest()`].
///
/// Events follow a strict ordering:
/// 1. [`Started`](Self::Started) exactly once.
/// 2. [`DiscoveryComplete`](Self::DiscoveryComplete) exactly once, with the
///    number of supported files found.
/// 3. [`Processed`](Self::Processed) or [`Failed`](Self::Failed), once per
///    discovered file.
/// 4. [`CatalogReady`](Self::CatalogReady) exactly once.
/// 5. [`Published`](Self::Published) exactly once, unless this is a dry run.
/// 6. [`Pruned`](Self::Pruned) at most once, when pruning is enabled.
/// 7. [`Complete`](Self::Complete) exactly once.
///
/// A structural error terminates the stream early, in which case
/// [`Complete`](Self::Complete) is never emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Started,
    DiscoveryComplete(u64),
    Processed(Box<Processed>),
    Failed(ItemFailure),
    CatalogReady { sections: usize, records: usize },
    Published(Published),
    Pruned(PruneSummary),
    Complete,
}

struct Analyzed {
    file: SourceFile,
    hash: ContentHash,
    media: MediaInfo,
    captured: CaptureDate,
}

struct Planned {
    file: SourceFile,
    hash: ContentHash,
    name: StandardName,
    media: MediaInfo,
    /// First file in walk order with this content.
    owner: bool,
}

/// State shared by every file of one run.
struct Run {
    builder: CatalogBuilder,
    uploader: Uploader,
    /// Root of the run's temporary working storage.
    workspace: PathBuf,
    /// Keys of every blob the catalog being built points at.
    referenced: Mutex<BTreeSet<String>>,
}

pub struct Pipeline {
    store: StoreHandle,
    generator: Arc<dyn DerivativeGenerator>,
    dates: CaptureDates,
    options: Options,
}
impl Pipeline {
    pub fn new(
        store: StoreHandle,
        generator: Arc<dyn DerivativeGenerator>,
        dates: CaptureDates,
        options: Options,
    ) -> Self {
        Self {
            store,
            generator,
            dates,
            options,
        }
    }

    /// Run to completion, returning the summary.
    pub async fn run(&self, source: &Path) -> Result<RunReport> {
        let mut report = RunReport::new(self.options.dry_run);
        let mut events = std::pin::pin!(self.ingest(source));
        while let Some(event) = events.next().await {
            report.record(&event?);
        }
        tracing::info!(%report, "Run complete");
        Ok(report)
    }

    /// Streams [`IngestEvent`]s while ingesting everything below `source`.
    ///
    /// Only the walk, creating temporary storage and publishing can fail the
    /// stream; per-file failures are reported as
    /// [`IngestEvent::Failed`] and processing carries on.
    pub fn ingest<'a>(&'a self, source: &'a Path) -> impl Stream<Item = Result<IngestEvent>> + 'a {
        // `rustfmt` does not format macros that use braces. Wrap in parentheses!
        stream!({
            yield Ok(IngestEvent::Started);

            let files = match walk::discover(source).await {
                Ok(files) => files,
                Err(err) => {
                    yield Err(err);
                    return;
                },
            };
            // Infallible: a usize (either 32- or 64-bit) will always fit in a u64.
            yield Ok(IngestEvent::DiscoveryComplete(u64::try_from(files.len()).unwrap_or(0)));

            let mut tmp = tempfile::Builder::new();
            tmp.prefix("vitrine-");
            let workspace = match &self.options.temp_root {
                Some(root) => tmp.tempdir_in(root),
                None => tmp.tempdir(),
            };
            let workspace = match workspace.or_raise(|| ErrorKind::Workspace) {
                Ok(dir) => dir,
                Err(err) => {
                    yield Err(err);
                    return;
                },
            };
            let concurrency = self.options.concurrency.max(1);
            let mut failures = 0u64;

            // Concurrent, but results come back in walk order so that names
            // are allocated the same way every run.
            let mut analyzed = Vec::with_capacity(files.len());
            let mut analyses = stream::iter(files).map(|file| self.analyze(file)).buffered(concurrency);
            while let Some((path, result)) = analyses.next().await {
                match result {
                    Ok(analysis) => analyzed.push(analysis),
                    Err(err) => {
                        failures += 1;
                        yield Ok(self.failed(path, &err));
                    },
                }
            }

            let run = Run {
                builder: CatalogBuilder::new(),
                uploader: Uploader::new(Arc::clone(&self.store), self.options.dry_run),
                workspace: workspace.path().to_path_buf(),
                referenced: Mutex::default(),
            };
            // Owners run first, so every duplicate references the record made
            // from the earliest file with that content.
            let (owners, duplicates): (Vec<_>, Vec<_>) = Self::plan(analyzed).into_iter().partition(|p| p.owner);
            for wave in [owners, duplicates] {
                let mut processing =
                    stream::iter(wave).map(|planned| self.process(&run, planned)).buffer_unordered(concurrency);
                while let Some(event) = processing.next().await {
                    if matches!(event, IngestEvent::Failed(_)) {
                        failures += 1;
                    }
                    yield Ok(event);
                }
            }

            let Run { builder, referenced, .. } = run;
            if let Err(err) = workspace.close() {
                tracing::warn!(error = %err, "Could not remove temporary working storage");
            }
            let catalog = builder.into_catalog();
            yield Ok(IngestEvent::CatalogReady {
                sections: catalog.sections.len(),
                records: catalog.len(),
            });
            if self.options.dry_run {
                tracing::info!("Dry run; nothing published");
                yield Ok(IngestEvent::Complete);
                return;
            }

            let snapshot = Snapshot {
                generated_at: OffsetDateTime::now_utc(),
                catalog,
            };
            let publisher = Publisher::new(Arc::clone(&self.store));
            match publisher.publish(&snapshot).await.or_raise(|| ErrorKind::Publish) {
                Ok(published) => {
                    yield Ok(IngestEvent::Published(published));
                },
                Err(err) => {
                    yield Err(err);
                    return;
                },
            }

            if self.options.prune {
                if failures > 0 {
                    tracing::warn!(failures, "Not pruning; blobs of files that failed this run may still be needed");
                } else {
                    let referenced = referenced.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
                    yield Ok(IngestEvent::Pruned(prune::prune(self.store.as_ref(), &referenced).await));
                }
            }

            yield Ok(IngestEvent::Complete);
        })
    }

    fn failed(&self, path: PathBuf, err: &crate::error::ItemError) -> IngestEvent {
        tracing::warn!(path = %path.display(), error = ?err, "Failed");
        IngestEvent::Failed(ItemFailure::new(path, err))
    }

    async fn analyze(&self, file: SourceFile) -> (PathBuf, ItemResult<Analyzed>) {
        let path = file.path.clone();
        let result: ItemResult<Analyzed> = async {
            let hash = hash_file(&file.path).await?;
            let media = self.generator.inspect(&file.path, file.kind).await.map_err(item(Stage::Probe))?;
            let (dates, source) = (self.dates.clone(), file.path.clone());
            let captured = tokio::task::spawn_blocking(move || dates.resolve(&source, &media))
                .await
                .map_err(|err| item(Stage::Probe)(exn::Exn::from(err)))?;
            tracing::debug!(
                path = %file.path.display(),
                %hash,
                captured = %captured.at,
                source = captured.source,
                "Hashed"
            );
            Ok(Analyzed {
                file,
                hash,
                media,
                captured,
            })
        }
        .await;
        (path, result)
    }

    /// Allocates names in walk order and marks the first file with each hash
    /// as its owner.
    fn plan(analyzed: Vec<Analyzed>) -> Vec<Planned> {
        let allocator = NameAllocator::new();
        let mut seen = HashSet::new();
        analyzed
            .into_iter()
            .map(|Analyzed { file, hash, media, captured }| {
                let name = allocator.allocate(&file.section, captured.at, &file.extension);
                let owner = seen.insert(hash.clone());
                Planned {
                    file,
                    hash,
                    name,
                    media,
                    owner,
                }
            })
            .collect()
    }

    async fn process(&self, run: &Run, planned: Planned) -> IngestEvent {
        let Planned {
            file, hash, name, media, ..
        } = planned;
        let display_name = name.to_string();
        let transferred = AtomicU64::new(0);
        let recorded = run
            .builder
            .record_or_reference(&file.section, &display_name, &hash, || {
                self.produce(run, &file, &hash, &name, &media, &transferred)
            })
            .await;
        let status = match recorded {
            Ok(Recorded::Reference) => {
                tracing::debug!(path = %file.path.display(), %hash, "Duplicate");
                Status::Duplicate
            },
            Ok(Recorded::New) => match transferred.load(Ordering::Relaxed) {
                0 => Status::Existing,
                blobs => Status::Uploaded { blobs },
            },
            Err(err) => return self.failed(file.path, &err),
        };
        tracing::debug!(
            path = %file.path.display(),
            section = %file.section,
            name = %display_name,
            ?status,
            "Recorded"
        );
        IngestEvent::Processed(Box::new(Processed {
            path: file.path,
            section: file.section,
            name: display_name,
            hash,
            status,
        }))
    }

    /// Probe existence and generate a derivative only if it's missing.
    async fn derive<Fut>(&self, run: &Run, key: &str, generate: Fut) -> ItemResult<Derived>
    where
        Fut: Future<Output = vitrine_media::error::Result<PathBuf>>,
    {
        if run.uploader.exists(key).await? {
            return Ok(Derived::Stored);
        }
        if self.options.dry_run {
            return Ok(Derived::Skipped);
        }
        Ok(Derived::Built(generate.await.map_err(item(Stage::Derivative))?))
    }

    /// Build the record for content not yet seen in this run.
    async fn produce(
        &self,
        run: &Run,
        file: &SourceFile,
        hash: &ContentHash,
        name: &StandardName,
        media: &MediaInfo,
        transferred: &AtomicU64,
    ) -> ItemResult<MediaRecord> {
        let path = file.path.as_path();
        let original_key = blob_key(Role::Original, name, hash, &file.extension);
        let thumb_key = blob_key(Role::Thumb, name, hash, THUMBNAIL_EXTENSION);
        let preview_key =
            (media.kind == MediaKind::Video).then(|| blob_key(Role::Preview, name, hash, PREVIEW_EXTENSION));

        let scratch = tempfile::tempdir_in(&run.workspace).map_err(item_io(Stage::Derivative))?;
        let thumb = self.derive(run, &thumb_key, self.generator.thumbnail(path, media, scratch.path())).await?;
        let preview = match &preview_key {
            Some(key) => Some(self.derive(run, key, self.generator.preview(path, scratch.path())).await?),
            None => None,
        };
        tracing::debug!(path = %path.display(), "DerivativesBuilt");

        let original = run.uploader.ensure_uploaded(&original_key, path).await?;
        let thumb = run.uploader.settle(&thumb_key, thumb).await?;
        let preview = match (&preview_key, preview) {
            (Some(key), Some(derived)) => Some(run.uploader.settle(key, derived).await?),
            _ => None,
        };
        let blobs = [Some(&original), Some(&thumb), preview.as_ref()]
            .into_iter()
            .flatten()
            .filter(|u| u.transferred());
        transferred.store(blobs.count() as u64, Ordering::Relaxed);
        tracing::debug!(path = %path.display(), "Uploaded");

        run.referenced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend([original_key, thumb_key].into_iter().chain(preview_key));

        let urls = match preview {
            None => Media::Image(ImageUrls {
                original: original.into_url(),
                thumb: thumb.into_url(),
            }),
            Some(preview) => Media::Video(VideoUrls {
                original: original.into_url(),
                thumb: thumb.into_url(),
                preview: preview.into_url(),
            }),
        };
        Ok(MediaRecord::new(hash.clone(), file.file_name(), media.dimensions, urls))
    }
}
