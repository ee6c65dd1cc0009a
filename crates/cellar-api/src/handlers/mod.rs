//! REST API handlers, grouped by resource.

pub mod buckets;
pub mod files;
pub mod projects;
pub mod snapshots;
pub mod tables;
pub mod workspaces;
