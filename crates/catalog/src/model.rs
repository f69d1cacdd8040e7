//! The catalog document consumed by the presentation layer.
//!
//! ```json
//! {
//!   "generatedAt": "2024-05-01T12:30:00.123Z",
//!   "sections": {
//!     "trip": {
//!       "images": {
//!         "2024-04-30-101500-001.jpg": {
//!           "contentHash": "9f86d0…",
//!           "originalFilename": "IMG_0042.jpg",
//!           "width": 4000,
//!           "height": 3000,
//!           "aspectRatio": 1.3333333333333333,
//!           "type": "image",
//!           "urls": { "original": "…", "thumb": "…" }
//!         }
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! Maps are ordered, so serializing the same catalog twice always produces
//! the same bytes.

use crate::error::{ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;
use vitrine_media::{Dimensions, MediaKind};

/// Hex-encoded (lowercase) SHA-256 digest of an original's bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);
impl ContentHash {
    pub fn parse(hex: impl Into<String>) -> Result<Self> {
        Ok(Self::try_from(hex.into())?)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl TryFrom<String> for ContentHash {
    type Error = ErrorKind;

    fn try_from(hex: String) -> std::result::Result<Self, Self::Error> {
        if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(ErrorKind::InvalidHash(hex));
        }
        Ok(Self(hex))
    }
}
impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}
impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrls {
    pub original: String,
    pub thumb: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoUrls {
    pub original: String,
    pub thumb: String,
    pub preview: String,
}

/// Kind-specific part of a record. Only videos have a preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "urls", rename_all = "lowercase")]
pub enum Media {
    Image(ImageUrls),
    Video(VideoUrls),
}
impl Media {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Image(_) => MediaKind::Image,
            Self::Video(_) => MediaKind::Video,
        }
    }

    pub fn original(&self) -> &str {
        match self {
            Self::Image(urls) => &urls.original,
            Self::Video(urls) => &urls.original,
        }
    }

    pub fn thumb(&self) -> &str {
        match self {
            Self::Image(urls) => &urls.thumb,
            Self::Video(urls) => &urls.thumb,
        }
    }

    pub fn preview(&self) -> Option<&str> {
        match self {
            Self::Image(_) => None,
            Self::Video(urls) => Some(&urls.preview),
        }
    }

    /// Every blob address this record points at.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        [Some(self.original()), Some(self.thumb()), self.preview()].into_iter().flatten()
    }
}

/// Durable description of one distinct piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRecord {
    pub content_hash: ContentHash,
    pub original_filename: String,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    #[serde(flatten)]
    pub media: Media,
}
impl MediaRecord {
    /// Builds a record, deriving `aspect_ratio` from the dimensions.
    pub fn new(
        content_hash: ContentHash,
        original_filename: impl Into<String>,
        dimensions: Dimensions,
        media: Media,
    ) -> Self {
        Self {
            content_hash,
            original_filename: original_filename.into(),
            width: dimensions.width,
            height: dimensions.height,
            aspect_ratio: dimensions.aspect_ratio(),
            media,
        }
    }
}

/// Records of one section, keyed by standard name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionCatalog {
    pub images: BTreeMap<String, MediaRecord>,
}

/// Every section of a run. The only durable cross-run state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootCatalog {
    pub sections: BTreeMap<String, SectionCatalog>,
}
impl RootCatalog {
    /// All records with the section and standard name they're listed under.
    pub fn records(&self) -> impl Iterator<Item = (&str, &str, &MediaRecord)> {
        self.sections.iter().flat_map(|(section, catalog)| {
            catalog.images.iter().map(move |(name, record)| (section.as_str(), name.as_str(), record))
        })
    }

    pub fn len(&self) -> usize {
        self.sections.values().map(|s| s.images.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A published catalog: the root catalog plus when it was generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    #[serde(flatten)]
    pub catalog: RootCatalog,
}
