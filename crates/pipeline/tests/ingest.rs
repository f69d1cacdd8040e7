use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::PrimitiveDateTime;
use time::macros::datetime;
use vitrine_catalog::{LATEST_KEY, Media, Publisher, RootCatalog};
use vitrine_media::error::{ErrorKind as MediaErrorKind, Result as MediaResult};
use vitrine_media::{
    CaptureDateSource, CaptureDates, DerivativeGenerator, Dimensions, MediaInfo, MediaKind, VideoProbe,
};
use vitrine_pipeline::error::{ErrorKind, Stage};
use vitrine_pipeline::{Options, Pipeline, RunReport, Status};
use vitrine_storage::ObjectStore;
use vitrine_storage::backend::MockBackend;

/// Derivative generator that never touches a codec.
///
/// Files whose contents start with `corrupt` fail to inspect. Videos report a
/// raw 1080x1920 stream, rotated by the number after `rotate=` in their
/// contents, if any.
#[derive(Default)]
struct StubGenerator {
    thumbnails: AtomicUsize,
    previews: AtomicUsize,
    /// Inspect calls per source file name.
    inspected: Mutex<HashMap<String, usize>>,
    /// Thumbnail calls per source file name.
    thumbnailed: Mutex<HashMap<String, usize>>,
}
impl StubGenerator {
    fn thumbnails(&self) -> usize {
        self.thumbnails.load(Ordering::SeqCst)
    }

    fn previews(&self) -> usize {
        self.previews.load(Ordering::SeqCst)
    }

    fn count(calls: &Mutex<HashMap<String, usize>>, source: &Path) {
        let name = source.file_name().unwrap().to_string_lossy().into_owned();
        *calls.lock().unwrap().entry(name).or_default() += 1;
    }

    fn write_derivative(source: &Path, workdir: &Path, suffix: &str) -> MediaResult<PathBuf> {
        let bytes = std::fs::read(source).map_err(|_| exn::Exn::from(MediaErrorKind::Io))?;
        let dest = workdir.join(format!("{}.{suffix}", source.file_name().unwrap().to_string_lossy()));
        std::fs::write(&dest, [suffix.as_bytes(), bytes.as_slice()].concat())
            .map_err(|_| exn::Exn::from(MediaErrorKind::Io))?;
        Ok(dest)
    }
}

#[async_trait]
impl DerivativeGenerator for StubGenerator {
    async fn inspect(&self, source: &Path, kind: MediaKind) -> MediaResult<MediaInfo> {
        Self::count(&self.inspected, source);
        let contents = std::fs::read_to_string(source).map_err(|_| exn::Exn::from(MediaErrorKind::Io))?;
        if contents.starts_with("corrupt") {
            exn::bail!(MediaErrorKind::Decode);
        }
        match kind {
            MediaKind::Image => Ok(MediaInfo::image(Dimensions::new(400, 300))),
            MediaKind::Video => {
                let rotation = contents.split_once("rotate=").and_then(|(_, r)| r.trim().parse().ok()).unwrap_or(0);
                let probe = VideoProbe {
                    width: 1080,
                    height: 1920,
                    rotation,
                    duration: Some(10.0),
                    creation_time: None,
                };
                Ok(MediaInfo::video(&probe))
            },
        }
    }

    async fn thumbnail(&self, source: &Path, _media: &MediaInfo, workdir: &Path) -> MediaResult<PathBuf> {
        self.thumbnails.fetch_add(1, Ordering::SeqCst);
        Self::count(&self.thumbnailed, source);
        Self::write_derivative(source, workdir, "thumb")
    }

    async fn preview(&self, source: &Path, workdir: &Path) -> MediaResult<PathBuf> {
        self.previews.fetch_add(1, Ordering::SeqCst);
        Self::write_derivative(source, workdir, "preview")
    }
}

/// Capture dates by file name, with a shared default.
struct FixedDates(HashMap<&'static str, PrimitiveDateTime>);
impl CaptureDateSource for FixedDates {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn capture_date(&self, path: &Path, _media: &MediaInfo) -> Option<PrimitiveDateTime> {
        let name = path.file_name()?.to_str()?;
        Some(self.0.get(name).copied().unwrap_or(datetime!(2023-07-14 09:05:03)))
    }
}

struct Fixture {
    source: tempfile::TempDir,
    store: Arc<MockBackend>,
    generator: Arc<StubGenerator>,
    dates: HashMap<&'static str, PrimitiveDateTime>,
}
impl Fixture {
    fn new(store: MockBackend) -> Self {
        Self {
            source: tempfile::tempdir().unwrap(),
            store: Arc::new(store),
            generator: Arc::new(StubGenerator::default()),
            dates: HashMap::new(),
        }
    }

    fn file(&self, relative: &str, contents: impl AsRef<[u8]>) -> &Self {
        let path = self.source.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
        self
    }

    fn pipeline(&self, options: Options) -> Pipeline {
        let dates = CaptureDates::new(vec![Arc::new(FixedDates(self.dates.clone()))]);
        Pipeline::new(self.store.clone(), self.generator.clone(), dates, options)
    }

    async fn run(&self) -> RunReport {
        self.run_with(Options::default()).await
    }

    async fn run_with(&self, options: Options) -> RunReport {
        let report = self.pipeline(options).run(self.source.path()).await.unwrap();
        // Snapshot keys have millisecond resolution.
        tokio::time::sleep(Duration::from_millis(5)).await;
        report
    }

    async fn latest(&self) -> RootCatalog {
        Publisher::new(self.store.clone()).latest().await.unwrap().expect("a published catalog").catalog
    }
}

#[tokio::test]
async fn test_duplicate_across_sections_is_uploaded_once() {
    let fixture = Fixture::new(MockBackend::default());
    let photo = vec![7u8; 2 * 1024 * 1024];
    fixture.file("trip/a.jpg", &photo).file("trip2/a-copy.jpg", &photo);

    let report = fixture.run().await;
    assert_eq!((report.discovered, report.uploaded, report.duplicates, report.failed), (2, 1, 1, 0));

    let catalog = fixture.latest().await;
    let a = &catalog.sections["trip"].images["2023-07-14-090503-001.jpg"];
    let copy = &catalog.sections["trip2"].images["2023-07-14-090503-001.jpg"];
    assert_eq!(a.content_hash, copy.content_hash);
    assert_eq!(a.media, copy.media);
    assert_eq!(a.original_filename, "a.jpg");
    assert_eq!(copy.original_filename, "a.jpg");

    let original_key = format!("originals/2023/07/{}.jpg", a.content_hash);
    assert_eq!(a.media.original(), fixture.store.public_url(&original_key));
    assert_eq!(fixture.store.put_count(&original_key).await, 1);
    assert_eq!(fixture.generator.thumbnails(), 1);
    // Original and thumbnail, plus the snapshot and latest.
    assert_eq!(fixture.store.total_puts().await, 4);
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let fixture = Fixture::new(MockBackend::default());
    fixture.file("trip/a.jpg", "a").file("trip/b.jpg", "b").file("trip/day2/clip.mov", "video rotate=90");

    let first = fixture.run().await;
    assert_eq!((first.uploaded, first.blobs_uploaded), (3, 7));
    let first_catalog = fixture.latest().await;
    let puts = fixture.store.total_puts().await;

    let second = fixture.run().await;
    assert_eq!((second.uploaded, second.existing, second.blobs_uploaded), (0, 3, 0));
    assert_eq!(fixture.latest().await, first_catalog);
    // Only the new snapshot and latest were written.
    assert_eq!(fixture.store.total_puts().await, puts + 2);
    assert_eq!(fixture.store.put_count(LATEST_KEY).await, 2);
    assert_eq!((fixture.generator.thumbnails(), fixture.generator.previews()), (3, 1));
}

#[tokio::test]
async fn test_names_are_unique_with_consecutive_serials() {
    let mut fixture = Fixture::new(MockBackend::default());
    fixture.dates.insert("later.jpg", datetime!(2023-07-14 09:05:04));
    fixture
        .file("trip/a.jpg", "a")
        .file("trip/b.jpg", "b")
        .file("trip/c.mov", "c")
        .file("trip/later.jpg", "later")
        .file("other/z.jpg", "z");
    fixture.run().await;

    let catalog = fixture.latest().await;
    let trip: Vec<_> =
        catalog.sections["trip"].images.iter().map(|(n, r)| (n.as_str(), r.original_filename.as_str())).collect();
    assert_eq!(
        trip,
        [
            ("2023-07-14-090503-001.jpg", "a.jpg"),
            ("2023-07-14-090503-002.jpg", "b.jpg"),
            ("2023-07-14-090503-003.mov", "c.mov"),
            ("2023-07-14-090504-001.jpg", "later.jpg"),
        ]
    );
    assert!(catalog.sections["other"].images.contains_key("2023-07-14-090503-001.jpg"));
}

#[tokio::test]
async fn test_one_corrupt_file_fails_alone() {
    let fixture = Fixture::new(MockBackend::default());
    fixture.file("trip/a.jpg", "a").file("trip/b.jpg", "corrupt!").file("trip/c.jpg", "c");

    let report = fixture.run().await;
    assert_eq!((report.uploaded, report.failed), (2, 1));
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].path.ends_with("trip/b.jpg"));
    assert_eq!(report.failures[0].stage, Stage::Probe);
    assert!(report.snapshot_key.is_some());

    let catalog = fixture.latest().await;
    assert_eq!(catalog.len(), 2);
    assert!(catalog.records().all(|(_, _, record)| record.original_filename != "b.jpg"));
}

#[tokio::test]
async fn test_rotated_video_record() {
    let fixture = Fixture::new(MockBackend::default());
    fixture.file("clips/portrait.mov", "video rotate=90").file("clips/upright.mp4", "video");
    fixture.run().await;

    let catalog = fixture.latest().await;
    let clips = &catalog.sections["clips"].images;
    let portrait = &clips["2023-07-14-090503-001.mov"];
    assert_eq!((portrait.width, portrait.height), (1920, 1080));
    assert_eq!(portrait.aspect_ratio, 1920.0 / 1080.0);
    let Media::Video(urls) = &portrait.media else {
        panic!("expected a video record");
    };
    assert_eq!(urls.preview, fixture.store.public_url(&format!("previews/2023/07/{}.mp4", portrait.content_hash)));
    assert_eq!(urls.thumb, fixture.store.public_url(&format!("thumbs/2023/07/{}.jpg", portrait.content_hash)));

    let upright = &clips["2023-07-14-090503-002.mp4"];
    assert_eq!((upright.width, upright.height), (1080, 1920));
    for (_, _, record) in catalog.records() {
        assert_eq!(record.aspect_ratio, f64::from(record.width) / f64::from(record.height));
    }
}

#[tokio::test]
async fn test_rerun_after_adding_a_file_uploads_only_that_file() {
    let fixture = Fixture::new(MockBackend::default());
    fixture.file("trip/a.jpg", "a").file("trip/b.jpg", "b");
    fixture.run().await;
    let before = fixture.latest().await;
    let puts = fixture.store.total_puts().await;

    let mut fixture = fixture;
    fixture.dates.insert("new.jpg", datetime!(2024-01-02 03:04:05));
    fixture.file("trip/new.jpg", "new");
    let report = fixture.run().await;
    assert_eq!((report.uploaded, report.existing), (1, 2));
    // Original and thumbnail of the new file, plus the snapshot and latest.
    assert_eq!(fixture.store.total_puts().await, puts + 4);

    let after = fixture.latest().await;
    for (section, name, record) in before.records() {
        assert_eq!(&after.sections[section].images[name], record);
    }
    assert!(after.sections["trip"].images.contains_key("2024-01-02-030405-001.jpg"));
}

#[tokio::test]
async fn test_publish_failure_leaves_latest_untouched() {
    let previous = br#"{"generatedAt":"2023-01-01T00:00:00Z","sections":{}}"#.to_vec();
    let store = MockBackend::with_objects([(LATEST_KEY, previous.clone())]).failing_puts_under("metadata/");
    let fixture = Fixture::new(store);
    fixture.file("trip/a.jpg", "a");

    let err = fixture.pipeline(Options::default()).run(fixture.source.path()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Publish));
    assert_eq!(fixture.store.get(LATEST_KEY).await.unwrap(), previous);
}

#[tokio::test]
async fn test_missing_source_root_aborts_before_any_write() {
    let fixture = Fixture::new(MockBackend::default());
    let missing = fixture.source.path().join("nope");
    let err = fixture.pipeline(Options::default()).run(&missing).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::SourceRoot(_)));
    assert_eq!(fixture.store.total_puts().await, 0);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let fixture = Fixture::new(MockBackend::default());
    fixture.file("trip/a.jpg", "a").file("trip/a-again.jpg", "a").file("trip/clip.mov", "video");

    let options = Options {
        dry_run: true,
        ..Options::default()
    };
    let report = fixture.run_with(options).await;
    assert!(report.dry_run);
    assert_eq!((report.uploaded, report.duplicates, report.blobs_uploaded), (2, 1, 5));
    assert_eq!((report.sections, report.records), (1, 3));
    assert_eq!(report.snapshot_key, None);
    assert_eq!(fixture.store.total_puts().await, 0);
    assert_eq!((fixture.generator.thumbnails(), fixture.generator.previews()), (0, 0));
}

#[tokio::test]
async fn test_prune_removes_unreferenced_blobs() {
    let stale = format!("originals/2020/01/{}.jpg", "e".repeat(64));
    let store = MockBackend::with_objects([(stale.as_str(), b"gone".to_vec())]);
    let fixture = Fixture::new(store);
    fixture.file("trip/a.jpg", "a");

    let options = Options {
        prune: true,
        ..Options::default()
    };
    let report = fixture.run_with(options).await;
    let pruned = report.pruned.expect("prune summary");
    assert_eq!((pruned.deleted, pruned.failed), (1, 0));
    assert!(!fixture.store.exists(&stale).await.unwrap());
    assert!(fixture.store.exists(LATEST_KEY).await.unwrap());
    assert_eq!(fixture.latest().await.len(), 1);
}

#[tokio::test]
async fn test_prune_is_skipped_when_files_failed() {
    let stale = format!("thumbs/2020/01/{}.jpg", "e".repeat(64));
    let fixture = Fixture::new(MockBackend::with_objects([(stale.as_str(), b"kept".to_vec())]));
    fixture.file("trip/a.jpg", "a").file("trip/b.jpg", "corrupt");

    let options = Options {
        prune: true,
        ..Options::default()
    };
    let report = fixture.run_with(options).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.pruned, None);
    assert!(fixture.store.exists(&stale).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_does_not_change_the_catalog() {
    let sequential = Fixture::new(MockBackend::default());
    let concurrent = Fixture::new(MockBackend::default());
    for fixture in [&sequential, &concurrent] {
        for i in 0..24 {
            // Every third file repeats earlier content in another section.
            let contents = format!("photo {}", i - i % 3);
            fixture.file(&format!("section-{}/{i:02}.jpg", i % 4), contents);
        }
    }
    let one = Options {
        concurrency: 1,
        ..Options::default()
    };
    let many = Options {
        concurrency: 16,
        ..Options::default()
    };
    let a = sequential.run_with(one).await;
    let b = concurrent.run_with(many).await;
    assert_eq!((a.uploaded, a.duplicates), (b.uploaded, b.duplicates));
    assert_eq!(sequential.latest().await, concurrent.latest().await);

    // One thumbnail per distinct content, never per file.
    let thumbnailed = concurrent.generator.thumbnailed.lock().unwrap().clone();
    assert_eq!(thumbnailed.len(), 8);
    assert!(thumbnailed.values().all(|&count| count == 1));
}

#[tokio::test]
async fn test_statuses_are_reported_per_file() {
    let fixture = Fixture::new(MockBackend::default());
    fixture.file("trip/a.jpg", "a").file("trip2/a.jpg", "a");
    let pipeline = fixture.pipeline(Options::default());
    let mut events = std::pin::pin!(pipeline.ingest(fixture.source.path()));
    let mut statuses = Vec::new();
    while let Some(event) = futures::StreamExt::next(&mut events).await {
        if let vitrine_pipeline::IngestEvent::Processed(processed) = event.unwrap() {
            statuses.push((processed.section.clone(), processed.status));
        }
    }
    statuses.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        statuses,
        [("trip".to_string(), Status::Uploaded { blobs: 2 }), ("trip2".to_string(), Status::Duplicate)]
    );
}

#[tokio::test]
async fn test_each_file_is_inspected_once() {
    let fixture = Fixture::new(MockBackend::default());
    fixture
        .file("trip/a.jpg", "a")
        .file("trip/clip.mov", "video rotate=90")
        .file("trip2/clip-copy.mov", "video rotate=90");
    let report = fixture.run().await;
    assert_eq!((report.uploaded, report.duplicates), (2, 1));

    let inspected = fixture.generator.inspected.lock().unwrap().clone();
    assert_eq!(inspected.len(), 3);
    assert!(inspected.values().all(|&count| count == 1), "{inspected:?}");
}

fn leftovers(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir).unwrap().map(|entry| entry.unwrap().path()).collect()
}

#[tokio::test]
async fn test_temporary_storage_is_removed_after_a_run() {
    let fixture = Fixture::new(MockBackend::default());
    fixture.file("trip/a.jpg", "a").file("trip/b.jpg", "corrupt").file("trip/clip.mov", "video");
    let temp = tempfile::tempdir().unwrap();

    let options = Options {
        temp_root: Some(temp.path().to_path_buf()),
        ..Options::default()
    };
    let report = fixture.run_with(options).await;
    assert_eq!((report.uploaded, report.failed), (2, 1));
    assert_eq!((fixture.generator.thumbnails(), fixture.generator.previews()), (2, 1));
    assert_eq!(leftovers(temp.path()), Vec::<PathBuf>::new());
}

#[tokio::test]
async fn test_temporary_storage_is_removed_after_a_publish_failure() {
    let fixture = Fixture::new(MockBackend::default().failing_puts_under("metadata/"));
    fixture.file("trip/a.jpg", "a").file("trip/clip.mov", "video");
    let temp = tempfile::tempdir().unwrap();

    let options = Options {
        temp_root: Some(temp.path().to_path_buf()),
        ..Options::default()
    };
    let err = fixture.pipeline(options).run(fixture.source.path()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Publish));
    assert_eq!(fixture.generator.thumbnails(), 2);
    assert_eq!(leftovers(temp.path()), Vec::<PathBuf>::new());
}

#[tokio::test]
async fn test_unusable_temporary_root_fails_the_run() {
    let fixture = Fixture::new(MockBackend::default());
    fixture.file("trip/a.jpg", "a");
    let options = Options {
        temp_root: Some(fixture.source.path().join("missing")),
        ..Options::default()
    };
    let err = fixture.pipeline(options).run(fixture.source.path()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Workspace));
    assert_eq!(fixture.store.total_puts().await, 0);
}
