//! Error types for cellar.

use thiserror::Error;

/// Result type alias using cellar's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cellar operations.
///
/// Variants map 1:1 onto the transport-neutral taxonomy: every transport
/// adapter (REST, RPC bridge, pg-wire) renders the [`ErrorClass`] of a value
/// into its own channel shape and never inspects variants directly.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request, unknown enum value, unparsable predicate.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Resource absent in the registry or on disk.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists, idempotency key conflict, duplicate rows.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Missing or invalid credential.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Valid credential but wrong scope.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Quota breach, workspace size limit, rate limit.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operation incompatible with the current resource state.
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Embedded engine failure (wraps duckdb::Error).
    #[error("Engine error: {0}")]
    Engine(#[from] duckdb::Error),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Statement or acquisition timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unanticipated failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidArgument(format!("malformed JSON: {e}"))
    }
}

/// Transport-neutral error classes from the propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    InvalidArgument,
    NotFound,
    Conflict,
    Unauthenticated,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    IoFailure,
    Timeout,
    Internal,
}

impl ErrorClass {
    /// Stable wire name used by the RPC bridge and error payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::InvalidArgument => "InvalidArgument",
            ErrorClass::NotFound => "NotFound",
            ErrorClass::Conflict => "Conflict",
            ErrorClass::Unauthenticated => "Unauthenticated",
            ErrorClass::PermissionDenied => "PermissionDenied",
            ErrorClass::ResourceExhausted => "ResourceExhausted",
            ErrorClass::FailedPrecondition => "FailedPrecondition",
            ErrorClass::IoFailure => "IOFailure",
            ErrorClass::Timeout => "Timeout",
            ErrorClass::Internal => "Internal",
        }
    }

    /// PostgreSQL SQLSTATE code for the pg-wire front-end.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            ErrorClass::InvalidArgument => "22023",
            ErrorClass::NotFound => "42P01",
            ErrorClass::Conflict => "23505",
            ErrorClass::Unauthenticated => "28P01",
            ErrorClass::PermissionDenied => "42501",
            ErrorClass::ResourceExhausted => "53400",
            ErrorClass::FailedPrecondition => "55000",
            ErrorClass::IoFailure => "58030",
            ErrorClass::Timeout => "57014",
            ErrorClass::Internal => "XX000",
        }
    }
}

impl Error {
    /// Classify this error for transport rendering.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidArgument(_) => ErrorClass::InvalidArgument,
            Error::NotFound(_) => ErrorClass::NotFound,
            Error::Conflict(_) => ErrorClass::Conflict,
            Error::Unauthenticated(_) => ErrorClass::Unauthenticated,
            Error::PermissionDenied(_) => ErrorClass::PermissionDenied,
            Error::ResourceExhausted(_) => ErrorClass::ResourceExhausted,
            Error::FailedPrecondition(_) => ErrorClass::FailedPrecondition,
            Error::Engine(_) | Error::Io(_) => ErrorClass::IoFailure,
            Error::Timeout(_) => ErrorClass::Timeout,
            Error::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Engine constraint violations surface as Conflict rather than IOFailure.
    ///
    /// DuckDB reports primary-key violations as generic engine errors; the
    /// import pipeline and the table engine use this to re-classify them.
    pub fn reclassify_constraint(self) -> Self {
        match self {
            Error::Engine(e) => {
                let msg = e.to_string();
                if msg.contains("Constraint Error")
                    || msg.contains("PRIMARY KEY or UNIQUE constraint")
                    || msg.contains("Duplicate key")
                {
                    Error::Conflict(msg)
                } else {
                    Error::Engine(e)
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("table orders".to_string());
        assert_eq!(err.to_string(), "Not found: table orders");
    }

    #[test]
    fn test_error_display_conflict() {
        let err = Error::Conflict("bucket exists".to_string());
        assert_eq!(err.to_string(), "Conflict: bucket exists");
    }

    #[test]
    fn test_class_mapping() {
        assert_eq!(
            Error::InvalidArgument("x".into()).class(),
            ErrorClass::InvalidArgument
        );
        assert_eq!(Error::Timeout("x".into()).class(), ErrorClass::Timeout);
        assert_eq!(
            Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")).class(),
            ErrorClass::IoFailure
        );
    }

    #[test]
    fn test_class_wire_names() {
        assert_eq!(ErrorClass::IoFailure.as_str(), "IOFailure");
        assert_eq!(ErrorClass::NotFound.as_str(), "NotFound");
    }

    #[test]
    fn test_sqlstate_families() {
        assert_eq!(ErrorClass::Unauthenticated.sqlstate(), "28P01");
        assert_eq!(ErrorClass::PermissionDenied.sqlstate(), "42501");
        assert_eq!(ErrorClass::Timeout.sqlstate(), "57014");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: Error = json_err.into();
        assert_eq!(err.class(), ErrorClass::InvalidArgument);
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
