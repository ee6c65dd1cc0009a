//! Identifier validation and naming conventions.
//!
//! Buckets surface to users as `{stage}.c-{name}` (for example `in.c-sales`)
//! and live on disk as `{stage}_c_{name}` directories. Tables and columns are
//! plain identifiers. All names are validated at the edge so that path
//! construction and SQL generation further down never see hostile input.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::models::Stage;

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]{0,127}$").expect("static regex"))
}

fn project_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("static regex"))
}

/// Validate an opaque project id (path-safe, no separators).
pub fn validate_project_id(id: &str) -> Result<()> {
    if project_re().is_match(id) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid project id {id:?}")))
    }
}

/// Validate a branch id. `default` is always valid.
pub fn validate_branch_id(id: &str) -> Result<()> {
    if id == "default" || project_re().is_match(id) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid branch id {id:?}")))
    }
}

/// Validate a bucket name (the part after the `c-` prefix).
pub fn validate_bucket_name(name: &str) -> Result<()> {
    if ident_re().is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid bucket name {name:?}")))
    }
}

/// Validate a table name.
pub fn validate_table_name(name: &str) -> Result<()> {
    if ident_re().is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid table name {name:?}")))
    }
}

/// Validate a column name. System columns start with `_`.
pub fn validate_column_name(name: &str) -> Result<()> {
    if ident_re().is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid column name {name:?}")))
    }
}

/// Quote an identifier for embedding in engine SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Directory (and attach-alias) name for a bucket: `{stage}_c_{name}`.
pub fn bucket_dir_name(stage: Stage, name: &str) -> String {
    format!("{}_c_{}", stage.as_str(), name)
}

/// User-facing bucket id: `{stage}.c-{name}`.
pub fn bucket_display_id(stage: Stage, name: &str) -> String {
    format!("{}.c-{}", stage.as_str(), name)
}

/// Parse a bucket directory name (`in_c_sales`) into `(stage, name)`.
pub fn parse_bucket_dir(dir: &str) -> Result<(Stage, String)> {
    let (stage_str, name) = dir
        .split_once("_c_")
        .ok_or_else(|| Error::InvalidArgument(format!("invalid bucket directory {dir:?}")))?;
    let stage = Stage::parse(stage_str)?;
    validate_bucket_name(name)?;
    Ok((stage, name.to_string()))
}

/// Parse a user-facing bucket id (`in.c-sales`) into `(stage, name)`.
///
/// A bare `{name}` is rejected: callers that accept a bare name must supply
/// the stage separately and call [`validate_bucket_name`].
pub fn parse_bucket_id(id: &str) -> Result<(Stage, String)> {
    let (stage_str, rest) = id
        .split_once('.')
        .ok_or_else(|| Error::InvalidArgument(format!("invalid bucket id {id:?}")))?;
    let stage = Stage::parse(stage_str)?;
    let name = rest
        .strip_prefix("c-")
        .ok_or_else(|| Error::InvalidArgument(format!("bucket id {id:?} missing c- prefix")))?;
    validate_bucket_name(name)?;
    Ok((stage, name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(validate_table_name("orders").is_ok());
        assert!(validate_table_name("orders_2024").is_ok());
        assert!(validate_column_name("_timestamp").is_ok());
        assert!(validate_bucket_name("c-s").is_ok());
    }

    #[test]
    fn test_rejects_hostile_names() {
        assert!(validate_table_name("../etc/passwd").is_err());
        assert!(validate_table_name("orders; DROP TABLE x").is_err());
        assert!(validate_table_name("").is_err());
        assert!(validate_project_id("a/b").is_err());
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_bucket_naming_roundtrip() {
        assert_eq!(bucket_dir_name(Stage::In, "s"), "in_c_s");
        assert_eq!(bucket_display_id(Stage::In, "s"), "in.c-s");
        let (stage, name) = parse_bucket_id("in.c-s").unwrap();
        assert_eq!(stage, Stage::In);
        assert_eq!(name, "s");
    }

    #[test]
    fn test_parse_bucket_id_rejects_bare_names() {
        assert!(parse_bucket_id("sales").is_err());
        assert!(parse_bucket_id("in.sales").is_err());
        assert!(parse_bucket_id("mid.c-sales").is_err());
    }
}
