pub mod error;
mod hash;
mod ingest;
mod naming;
mod prune;
mod report;
mod upload;
mod walk;

pub use crate::hash::{hash_file, hash_file_blocking, hash_reader};
pub use crate::ingest::{IngestEvent, Options, Pipeline, Processed, Status};
pub use crate::naming::{NameAllocator, StandardName};
pub use crate::prune::{PruneSummary, prune};
pub use crate::report::{ItemFailure, RunReport};
pub use crate::upload::{Derived, Role, Upload, Uploader, blob_key};
pub use crate::walk::{SourceFile, discover};
