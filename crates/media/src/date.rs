//! Capture-date resolution.
//!
//! A file's capture date is resolved by asking an ordered chain of
//! [`CaptureDateSource`]s; the first one that answers wins. When none of them
//! can answer, the current wall-clock time is used, so resolution itself can
//! never fail.

use crate::MediaKind;
use crate::generator::MediaInfo;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use time::{Date, Month, PrimitiveDateTime, Time, UtcDateTime};

/// A single strategy for finding out when a file was captured.
pub trait CaptureDateSource: Send + Sync {
    /// Short name recorded alongside resolved dates (for logging).
    fn name(&self) -> &'static str;

    /// Returns `None` when this source has nothing to say about the file,
    /// including when reading it fails.
    fn capture_date(&self, path: &Path, media: &MediaInfo) -> Option<PrimitiveDateTime>;
}

/// A resolved capture date and the source that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureDate {
    pub at: PrimitiveDateTime,
    pub source: &'static str,
}

/// Name reported when every source declined and the wall clock was used.
pub const WALL_CLOCK: &str = "wall-clock";

/// Ordered chain of capture-date sources.
#[derive(Clone)]
pub struct CaptureDates {
    sources: Vec<Arc<dyn CaptureDateSource>>,
}
impl CaptureDates {
    pub fn new(sources: Vec<Arc<dyn CaptureDateSource>>) -> Self {
        Self { sources }
    }

    /// Embedded metadata first (EXIF for images, container tags for videos),
    /// then the filesystem creation time.
    pub fn standard() -> Self {
        Self::new(vec![Arc::new(ExifDate), Arc::new(VideoCreationDate), Arc::new(CreatedDate)])
    }

    /// Blocking: sources may read file headers.
    pub fn resolve(&self, path: &Path, media: &MediaInfo) -> CaptureDate {
        for source in &self.sources {
            if let Some(at) = source.capture_date(path, media) {
                tracing::trace!(path = %path.display(), source = source.name(), %at, "Capture date resolved");
                return CaptureDate { at, source: source.name() };
            }
        }
        tracing::debug!(path = %path.display(), "No capture date available; using current time");
        CaptureDate {
            at: to_primitive(UtcDateTime::now()),
            source: WALL_CLOCK,
        }
    }
}

fn to_primitive(utc: UtcDateTime) -> PrimitiveDateTime {
    PrimitiveDateTime::new(utc.date(), utc.time())
}

/// EXIF `DateTimeOriginal`, falling back to `DateTimeDigitized` then
/// `DateTime`. Images only.
pub struct ExifDate;
impl ExifDate {
    fn from_exif(dt: &exif::DateTime) -> Option<PrimitiveDateTime> {
        let month = Month::try_from(dt.month).ok()?;
        let date = Date::from_calendar_date(i32::from(dt.year), month, dt.day).ok()?;
        let time = Time::from_hms(dt.hour, dt.minute, dt.second).ok()?;
        Some(PrimitiveDateTime::new(date, time))
    }

    fn parse_field(exif: &exif::Exif, tag: exif::Tag) -> Option<PrimitiveDateTime> {
        let field = exif.get_field(tag, exif::In::PRIMARY)?;
        let exif::Value::Ascii(ref values) = field.value else {
            return None;
        };
        let raw = values.first()?;
        Self::from_exif(&exif::DateTime::from_ascii(raw).ok()?)
    }
}
impl CaptureDateSource for ExifDate {
    fn name(&self) -> &'static str {
        "exif"
    }

    fn capture_date(&self, path: &Path, media: &MediaInfo) -> Option<PrimitiveDateTime> {
        if media.kind != MediaKind::Image {
            return None;
        }
        let mut reader = BufReader::new(File::open(path).ok()?);
        let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;
        [exif::Tag::DateTimeOriginal, exif::Tag::DateTimeDigitized, exif::Tag::DateTime]
            .into_iter()
            .find_map(|tag| Self::parse_field(&exif, tag))
    }
}

/// Container `creation_time` tag, as found when the video was probed.
pub struct VideoCreationDate;
impl CaptureDateSource for VideoCreationDate {
    fn name(&self) -> &'static str {
        "video-metadata"
    }

    fn capture_date(&self, _path: &Path, media: &MediaInfo) -> Option<PrimitiveDateTime> {
        media.created.filter(|_| media.kind == MediaKind::Video)
    }
}

/// Filesystem creation (birth) time. Not every platform or filesystem
/// records one.
pub struct CreatedDate;
impl CaptureDateSource for CreatedDate {
    fn name(&self) -> &'static str {
        "file-created"
    }

    fn capture_date(&self, path: &Path, _media: &MediaInfo) -> Option<PrimitiveDateTime> {
        let created = std::fs::metadata(path).ok()?.created().ok()?;
        Some(to_primitive(UtcDateTime::from(created)))
    }
}
