//! # cellar-core
//!
//! Core types, traits, and abstractions for the cellar storage backend.
//!
//! This crate provides the foundational data structures, the error taxonomy,
//! the on-disk path layout, and the hierarchical snapshot-settings resolver
//! that every other cellar crate depends on.

pub mod defaults;
pub mod error;
pub mod layout;
pub mod logging;
pub mod models;
pub mod names;
pub mod settings;

// Re-export commonly used types at crate root
pub use error::{Error, ErrorClass, Result};
pub use layout::Layout;
pub use models::*;
pub use names::{
    bucket_dir_name, bucket_display_id, parse_bucket_dir, parse_bucket_id, quote_ident,
    validate_branch_id, validate_bucket_name, validate_column_name, validate_project_id,
    validate_table_name,
};
pub use settings::{resolve_setting, ScopeChain, SnapshotConfig};
