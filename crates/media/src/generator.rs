//! Derivative generation: dimensions, thumbnails and video previews.

use crate::error::{ErrorKind, Result};
use crate::ffmpeg::{Ffmpeg, VideoProbe};
use crate::{MediaKind, still};
use async_trait::async_trait;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::PrimitiveDateTime;

/// File extension of generated thumbnails.
pub const THUMBNAIL_EXTENSION: &str = "jpg";
/// File extension of generated video previews.
pub const PREVIEW_EXTENSION: &str = "mp4";

/// Displayed pixel dimensions. Both sides are always non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}
impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(&self) -> f64 {
        f64::from(self.width) / f64::from(self.height)
    }
}

/// What was learned about a source file by inspecting it once.
///
/// Everything downstream (capture dates, thumbnails, the catalog record)
/// works from this instead of probing the file again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaInfo {
    pub kind: MediaKind,
    /// Displayed dimensions, with rotation and orientation applied.
    pub dimensions: Dimensions,
    /// Length of a video in seconds, when the container reports one.
    pub duration: Option<f64>,
    /// Creation time embedded in a video container, in UTC.
    pub created: Option<PrimitiveDateTime>,
}
impl MediaInfo {
    pub fn image(dimensions: Dimensions) -> Self {
        Self {
            kind: MediaKind::Image,
            dimensions,
            duration: None,
            created: None,
        }
    }

    pub fn video(probe: &VideoProbe) -> Self {
        Self {
            kind: MediaKind::Video,
            dimensions: probe.dimensions(),
            duration: probe.duration,
            created: probe.creation_time,
        }
    }
}

/// Tunables for derivative generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivativeSettings {
    /// Thumbnails are scaled down to at most this many pixels wide.
    pub thumbnail_max_width: u32,
    /// JPEG quality of thumbnails, 1-100.
    pub thumbnail_quality: u8,
    /// Where in a video to grab its thumbnail frame.
    pub frame_offset_seconds: f64,
    /// Length of video previews.
    pub preview_seconds: u32,
    /// Video previews are scaled down to at most this many pixels tall.
    pub preview_height: u32,
}
impl Default for DerivativeSettings {
    fn default() -> Self {
        Self {
            thumbnail_max_width: 800,
            thumbnail_quality: 80,
            frame_offset_seconds: 1.0,
            preview_seconds: 3,
            preview_height: 480,
        }
    }
}

/// Produces the derived artefacts for a single source file.
///
/// Output is written into the caller-provided scratch directory; the caller
/// owns (and cleans up) everything written there.
#[async_trait]
pub trait DerivativeGenerator: Send + Sync {
    /// Reads the source's headers (or probes the video) once.
    async fn inspect(&self, source: &Path, kind: MediaKind) -> Result<MediaInfo>;

    /// Writes a JPEG thumbnail into `workdir` and returns its path.
    async fn thumbnail(&self, source: &Path, media: &MediaInfo, workdir: &Path) -> Result<PathBuf>;

    /// Writes a short MP4 preview of a video into `workdir` and returns its
    /// path.
    async fn preview(&self, source: &Path, workdir: &Path) -> Result<PathBuf>;
}

/// [`DerivativeGenerator`] backed by the `image` crate for stills and the
/// ffmpeg tools for video.
///
/// Without ffmpeg, images are still handled and every video fails with
/// [`ErrorKind::ToolNotFound`].
pub struct CodecGenerator {
    settings: DerivativeSettings,
    ffmpeg: Option<Arc<Ffmpeg>>,
}
impl CodecGenerator {
    pub fn new(settings: DerivativeSettings, ffmpeg: Option<Arc<Ffmpeg>>) -> Self {
        Self { settings, ffmpeg }
    }

    fn ffmpeg(&self) -> Result<&Ffmpeg> {
        match self.ffmpeg.as_deref() {
            Some(ffmpeg) => Ok(ffmpeg),
            None => exn::bail!(ErrorKind::ToolNotFound("ffmpeg")),
        }
    }
}

fn output_path(source: &Path, workdir: &Path, suffix: &str, extension: &str) -> PathBuf {
    let stem = source.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    workdir.join(format!("{stem}.{suffix}.{extension}"))
}

#[async_trait]
impl DerivativeGenerator for CodecGenerator {
    async fn inspect(&self, source: &Path, kind: MediaKind) -> Result<MediaInfo> {
        match kind {
            MediaKind::Image => {
                let source = source.to_path_buf();
                let dimensions =
                    tokio::task::spawn_blocking(move || still::dimensions(&source)).await.or_raise(|| ErrorKind::Io)??;
                Ok(MediaInfo::image(dimensions))
            },
            MediaKind::Video => Ok(MediaInfo::video(&self.ffmpeg()?.probe(source).await?)),
        }
    }

    async fn thumbnail(&self, source: &Path, media: &MediaInfo, workdir: &Path) -> Result<PathBuf> {
        let dest = output_path(source, workdir, "thumb", THUMBNAIL_EXTENSION);
        match media.kind {
            MediaKind::Image => {
                let (source, target) = (source.to_path_buf(), dest.clone());
                let (max_width, quality) = (self.settings.thumbnail_max_width, self.settings.thumbnail_quality);
                tokio::task::spawn_blocking(move || still::thumbnail(&source, &target, max_width, quality))
                    .await
                    .or_raise(|| ErrorKind::Io)??;
            },
            MediaKind::Video => {
                self.ffmpeg()?.thumbnail(source, &dest, &self.settings, media.duration).await?;
            },
        }
        Ok(dest)
    }

    async fn preview(&self, source: &Path, workdir: &Path) -> Result<PathBuf> {
        let dest = output_path(source, workdir, "preview", PREVIEW_EXTENSION);
        self.ffmpeg()?.preview(source, &dest, &self.settings).await?;
        Ok(dest)
    }
}
