mod builder;
pub mod error;
mod model;
mod publisher;

pub use crate::builder::{CatalogBuilder, Recorded};
pub use crate::model::{
    ContentHash, ImageUrls, Media, MediaRecord, RootCatalog, SectionCatalog, Snapshot, VideoUrls,
};
pub use crate::publisher::{LATEST_KEY, METADATA_PREFIX, Published, Publisher, snapshot_key};
