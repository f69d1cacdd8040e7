mod date;
pub mod error;
mod ffmpeg;
mod generator;
mod kind;
mod still;

pub use crate::date::{
    CaptureDate, CaptureDateSource, CaptureDates, CreatedDate, ExifDate, VideoCreationDate, WALL_CLOCK,
};
pub use crate::ffmpeg::{Ffmpeg, VideoProbe};
pub use crate::generator::{
    CodecGenerator, DerivativeGenerator, DerivativeSettings, Dimensions, MediaInfo, PREVIEW_EXTENSION,
    THUMBNAIL_EXTENSION,
};
pub use crate::kind::MediaKind;
