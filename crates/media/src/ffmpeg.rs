//! ffmpeg/ffprobe integration.
//!
//! Video decoding is delegated to the ffmpeg command-line tools, discovered
//! on `PATH` once at startup. Everything here is scoped to one file: a failure
//! is reported as an error for that file only.

use crate::error::{ErrorKind, Result};
use crate::generator::{DerivativeSettings, Dimensions};
use exn::{OptionExt, ResultExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Located ffmpeg and ffprobe executables.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}
impl Ffmpeg {
    pub fn discover() -> Result<Self> {
        let ffmpeg = which::which("ffmpeg").or_raise(|| ErrorKind::ToolNotFound("ffmpeg"))?;
        let ffprobe = which::which("ffprobe").or_raise(|| ErrorKind::ToolNotFound("ffprobe"))?;
        tracing::debug!(ffmpeg = %ffmpeg.display(), ffprobe = %ffprobe.display(), "Discovered ffmpeg tools");
        Ok(Self { ffmpeg, ffprobe })
    }

    pub fn with_paths(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Probe a video, falling back to piping its bytes through stdin when
    /// ffprobe can't make sense of the file by path.
    pub async fn probe(&self, path: &Path) -> Result<VideoProbe> {
        let primary = async {
            let output = Command::new(&self.ffprobe)
                .args(probe_args(path.as_os_str()))
                .stdin(Stdio::null())
                .output()
                .await
                .or_raise(|| ErrorKind::Io)?;
            VideoProbe::from_json(&check("ffprobe", output)?)
        };
        match primary.await {
            Ok(probe) => Ok(probe),
            Err(err) => {
                tracing::debug!(
                    path = %path.display(),
                    error = %err,
                    "ffprobe failed; retrying from an in-memory buffer"
                );
                self.probe_buffered(path).await.or_raise(|| ErrorKind::Probe)
            },
        }
    }

    async fn probe_buffered(&self, path: &Path) -> Result<VideoProbe> {
        let bytes = tokio::fs::read(path).await.or_raise(|| ErrorKind::Io)?;
        let mut child = Command::new(&self.ffprobe)
            .args(probe_args(OsStr::new("pipe:0")))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .or_raise(|| ErrorKind::Io)?;
        let mut stdin = child.stdin.take().ok_or_raise(|| ErrorKind::Io)?;
        // ffprobe stops reading once it has seen enough of the container, so
        // a broken pipe here is expected and harmless.
        let writer = tokio::spawn(async move {
            let _ = stdin.write_all(&bytes).await;
        });
        let output = child.wait_with_output().await.or_raise(|| ErrorKind::Io)?;
        let _ = writer.await;
        VideoProbe::from_json(&check("ffprobe", output)?)
    }

    /// Extract a single still frame as a JPEG.
    ///
    /// Seeks to the configured offset; clips shorter than that get their
    /// first frame instead.
    pub async fn thumbnail(
        &self,
        source: &Path,
        dest: &Path,
        settings: &DerivativeSettings,
        duration: Option<f64>,
    ) -> Result<()> {
        let offset = match duration {
            Some(duration) if duration <= settings.frame_offset_seconds => 0.0,
            _ => settings.frame_offset_seconds,
        };
        self.run_ffmpeg(thumbnail_args(source, dest, offset, settings)).await?;
        // Seeking past the end isn't an error to ffmpeg, it just writes
        // nothing at all.
        if offset > 0.0 && !non_empty(dest).await {
            tracing::debug!(source = %source.display(), offset, "No frame at offset; using the first frame");
            self.run_ffmpeg(thumbnail_args(source, dest, 0.0, settings)).await?;
        }
        if !non_empty(dest).await {
            exn::bail!(ErrorKind::Encode);
        }
        Ok(())
    }

    /// Re-encode the start of a video as a short, low resolution H.264 clip.
    pub async fn preview(&self, source: &Path, dest: &Path, settings: &DerivativeSettings) -> Result<()> {
        self.run_ffmpeg(preview_args(source, dest, settings)).await?;
        if !non_empty(dest).await {
            exn::bail!(ErrorKind::Encode);
        }
        Ok(())
    }

    async fn run_ffmpeg(&self, args: Vec<OsString>) -> Result<()> {
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .or_raise(|| ErrorKind::Io)?;
        check("ffmpeg", output)?;
        Ok(())
    }
}

async fn non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.len() > 0)
}

fn check(tool: &'static str, output: Output) -> Result<Vec<u8>> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        exn::bail!(ErrorKind::ToolFailed {
            tool,
            code: output.status.code(),
            stderr,
        });
    }
    Ok(output.stdout)
}

fn probe_args(input: &OsStr) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-v", "error", "-print_format", "json", "-show_format", "-show_streams"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(input.to_os_string());
    args
}

/// Maps a 1-100 quality onto ffmpeg's MJPEG `-q:v` scale (2 best, 31 worst).
fn jpeg_qscale(quality: u8) -> u32 {
    let quality = u32::from(quality.clamp(1, 100));
    2 + (100 - quality) * 29 / 99
}

fn thumbnail_args(source: &Path, dest: &Path, offset: f64, settings: &DerivativeSettings) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::with_capacity(16);
    args.extend(["-v", "error", "-y"].map(OsString::from));
    if offset > 0.0 {
        args.extend([OsString::from("-ss"), OsString::from(format!("{offset}"))]);
    }
    args.extend([OsString::from("-i"), source.as_os_str().to_os_string()]);
    args.extend([
        OsString::from("-frames:v"),
        OsString::from("1"),
        OsString::from("-vf"),
        OsString::from(format!("scale='min({},iw)':-2", settings.thumbnail_max_width)),
        OsString::from("-q:v"),
        OsString::from(jpeg_qscale(settings.thumbnail_quality).to_string()),
    ]);
    args.push(dest.as_os_str().to_os_string());
    args
}

fn preview_args(source: &Path, dest: &Path, settings: &DerivativeSettings) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-v", "error", "-y", "-i"].map(OsString::from).into();
    args.push(source.as_os_str().to_os_string());
    args.extend(
        [
            "-t".to_string(),
            settings.preview_seconds.to_string(),
            "-vf".to_string(),
            format!("scale=-2:'min({},ih)'", settings.preview_height),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "veryfast".to_string(),
            "-crf".to_string(),
            "28".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-an".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
        ]
        .map(OsString::from),
    );
    args.push(dest.as_os_str().to_os_string());
    args
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: ProbeFormat,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    side_data_list: Vec<ProbeSideData>,
}

#[derive(Deserialize)]
struct ProbeSideData {
    rotation: Option<f64>,
}

#[derive(Deserialize, Default)]
struct ProbeFormat {
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

/// What ffprobe reports about a video's first video stream.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProbe {
    /// Raw (coded) stream width, before rotation.
    pub width: u32,
    /// Raw (coded) stream height, before rotation.
    pub height: u32,
    /// Rotation in degrees, as recorded in the container.
    pub rotation: i32,
    pub duration: Option<f64>,
    /// Container creation time, converted to UTC.
    pub creation_time: Option<PrimitiveDateTime>,
}
impl VideoProbe {
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let output: ProbeOutput = serde_json::from_slice(json).or_raise(|| ErrorKind::Probe)?;
        let ProbeOutput { streams, format } = output;
        let stream = streams
            .into_iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .ok_or_raise(|| ErrorKind::Probe)?;
        let (width, height) = match (stream.width, stream.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => exn::bail!(ErrorKind::Probe),
        };
        // Older muxers write a `rotate` tag, newer ones a display matrix.
        let rotation = stream
            .tags
            .get("rotate")
            .and_then(|r| r.trim().parse::<i32>().ok())
            .or_else(|| stream.side_data_list.iter().find_map(|d| d.rotation).map(|r| r.round() as i32))
            .unwrap_or(0);
        let creation_time = format
            .tags
            .get("creation_time")
            .or_else(|| stream.tags.get("creation_time"))
            .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
            .map(|dt| {
                let utc = dt.to_offset(UtcOffset::UTC);
                PrimitiveDateTime::new(utc.date(), utc.time())
            });
        let duration = format.duration.and_then(|d| d.trim().parse::<f64>().ok());
        Ok(Self {
            width,
            height,
            rotation,
            duration,
            creation_time,
        })
    }

    /// Displayed dimensions: a quarter turn swaps width and height.
    pub fn dimensions(&self) -> Dimensions {
        match self.rotation.rem_euclid(180) == 90 {
            true => Dimensions::new(self.height, self.width),
            false => Dimensions::new(self.width, self.height),
        }
    }
}
