//! # cellar-files
//!
//! Content-addressed local file storage with a prepare/upload/register
//! workflow, per-project quotas, and the flat object store backing the
//! S3-compatible surface.

pub mod objects;
pub mod store;

pub use objects::{ListOutcome, ObjectMeta, ObjectStore};
pub use store::{FilesStore, PrepareOutcome};
