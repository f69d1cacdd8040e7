//! End-of-run summary.

use crate::error::{ItemErrorKind, Stage};
use crate::ingest::{IngestEvent, Status};
use crate::prune::PruneSummary;
use std::fmt;
use std::path::PathBuf;

/// A source file that was left out of the catalog, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub path: PathBuf,
    pub stage: Stage,
    pub reason: String,
}
impl ItemFailure {
    pub fn new(path: impl Into<PathBuf>, err: &ItemErrorKind) -> Self {
        Self {
            path: path.into(),
            stage: err.stage,
            reason: err.reason.clone(),
        }
    }
}
impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} failed: {}", self.path.display(), self.stage, self.reason)
    }
}

/// Counts of what happened to each discovered file, built up from
/// [`IngestEvent`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub dry_run: bool,
    pub discovered: u64,
    /// New content with at least one blob transferred.
    pub uploaded: u64,
    /// New to this run's catalog, but every blob was already stored.
    pub existing: u64,
    /// Same content as another file in this run.
    pub duplicates: u64,
    pub failed: u64,
    pub failures: Vec<ItemFailure>,
    pub blobs_uploaded: u64,
    pub sections: usize,
    pub records: usize,
    pub snapshot_key: Option<String>,
    pub pruned: Option<PruneSummary>,
}
impl RunReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    /// Files that cost no upload, for whatever reason.
    pub fn skipped(&self) -> u64 {
        self.existing + self.duplicates
    }

    pub fn record(&mut self, event: &IngestEvent) {
        match event {
            IngestEvent::DiscoveryComplete(count) => self.discovered = *count,
            IngestEvent::Processed(processed) => match processed.status {
                Status::Uploaded { blobs } => {
                    self.uploaded += 1;
                    self.blobs_uploaded += blobs;
                },
                Status::Existing => self.existing += 1,
                Status::Duplicate => self.duplicates += 1,
            },
            IngestEvent::Failed(failure) => {
                self.failed += 1;
                self.failures.push(failure.clone());
            },
            IngestEvent::CatalogReady { sections, records } => {
                self.sections = *sections;
                self.records = *records;
            },
            IngestEvent::Published(published) => self.snapshot_key = Some(published.key.clone()),
            IngestEvent::Pruned(summary) => self.pruned = Some(*summary),
            IngestEvent::Started | IngestEvent::Complete => {},
        }
    }
}
impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uploaded = if self.dry_run { "to upload" } else { "uploaded" };
        write!(
            f,
            concat!(
                "{} files in {} sections: {} {uploaded}, {} skipped ({} already stored, {} duplicates), ",
                "{} failed; {} blobs {uploaded}",
            ),
            self.discovered,
            self.sections,
            self.uploaded,
            self.skipped(),
            self.existing,
            self.duplicates,
            self.failed,
            self.blobs_uploaded,
            uploaded = uploaded,
        )?;
        if let Some(key) = &self.snapshot_key {
            write!(f, "; published {key}")?;
        }
        if let Some(pruned) = &self.pruned {
            write!(f, "; pruned {} blobs ({} failed)", pruned.deleted, pruned.failed)?;
        }
        Ok(())
    }
}
