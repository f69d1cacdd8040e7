//! Still image handling with the `image` crate.
//!
//! All functions here are blocking and are expected to be run on a blocking
//! thread by the caller.

use crate::error::{ErrorKind, Result};
use crate::generator::Dimensions;
use exn::ResultExt;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::Path;

/// Cameras store pixels as the sensor saw them and record how to turn them
/// upright in the EXIF orientation; a phone held in portrait writes landscape
/// pixels with a 90 degree rotation.
fn upright(width: u32, height: u32, orientation: Orientation) -> Dimensions {
    match orientation {
        Orientation::Rotate90 | Orientation::Rotate270 | Orientation::Rotate90FlipH | Orientation::Rotate270FlipH => {
            Dimensions::new(height, width)
        },
        _ => Dimensions::new(width, height),
    }
}

fn header_dimensions(path: &Path) -> image::ImageResult<Dimensions> {
    // Guessing from content copes with a PNG saved as `.jpg`, which is
    // surprisingly common.
    let mut decoder = ImageReader::open(path)?.with_guessed_format()?.into_decoder()?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let (width, height) = decoder.dimensions();
    Ok(upright(width, height, orientation))
}

/// Decode the whole image into memory and turn it upright.
fn decode_upright(path: &Path) -> Result<DynamicImage> {
    let buffer = std::fs::read(path).or_raise(|| ErrorKind::Io)?;
    let mut decoder = ImageReader::new(Cursor::new(buffer))
        .with_guessed_format()
        .or_raise(|| ErrorKind::Io)?
        .into_decoder()
        .or_raise(|| ErrorKind::Decode)?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut decoded = DynamicImage::from_decoder(decoder).or_raise(|| ErrorKind::Decode)?;
    decoded.apply_orientation(orientation);
    Ok(decoded)
}

/// Displayed dimensions, read from the file header where possible and by
/// decoding the whole image otherwise.
pub(crate) fn dimensions(path: &Path) -> Result<Dimensions> {
    let dimensions = match header_dimensions(path) {
        Ok(dimensions) => dimensions,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "Header probe failed; decoding from buffer");
            let decoded = decode_upright(path).or_raise(|| ErrorKind::Probe)?;
            Dimensions::new(decoded.width(), decoded.height())
        },
    };
    if dimensions.width == 0 || dimensions.height == 0 {
        exn::bail!(ErrorKind::Probe);
    }
    Ok(dimensions)
}

/// Size of a thumbnail for an image of the given size: capped to `max_width`
/// with the aspect ratio kept. Images are never upscaled.
pub(crate) fn thumbnail_size(source: Dimensions, max_width: u32) -> Dimensions {
    if source.width <= max_width {
        return source;
    }
    let (width, height) = (u64::from(source.width), u64::from(source.height));
    let height = (height * u64::from(max_width) + width / 2) / width;
    Dimensions::new(max_width, height.clamp(1, u64::from(u32::MAX)) as u32)
}

/// Decode, turn upright, downscale and write the image as a JPEG to `dest`.
pub(crate) fn thumbnail(source: &Path, dest: &Path, max_width: u32, quality: u8) -> Result<()> {
    let decoded = decode_upright(source)?;
    let size = thumbnail_size(Dimensions::new(decoded.width(), decoded.height()), max_width);
    let resized = match size.width == decoded.width() {
        true => decoded,
        false => decoded.resize_exact(size.width, size.height, FilterType::Lanczos3),
    };
    // JPEG has no alpha channel.
    let rgb = resized.to_rgb8();
    let mut writer = BufWriter::new(File::create(dest).or_raise(|| ErrorKind::Io)?);
    JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100))
        .encode_image(&rgb)
        .or_raise(|| ErrorKind::Encode)?;
    std::io::Write::flush(&mut writer).or_raise(|| ErrorKind::Io)?;
    Ok(())
}
