//! Error types for Lattice

use thiserror::Error;

/// Result type alias using Lattice's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Lattice error types
#[derive(Error, Debug)]
pub enum Error {
    // Not-found errors (E001-E099)
    #[error("Object '{0}' has no visible head version")]
    ObjectNotFound(String),

    #[error("Relationship '{0}' has no visible head version")]
    RelationshipNotFound(String),

    #[error("Branch '{0}' not found")]
    BranchNotFound(String),

    #[error("Job '{0}' not found")]
    JobNotFound(String),

    // Conflict errors (E100-E199)
    #[error("Conflict: {0}")]
    Conflict(String),

    // Input errors (E200-E299)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Lock errors (E300-E399)
    #[error("Lock timeout: merge lock '{0}' is held by another operation")]
    LockTimeout(String),

    // Deadline errors (E400-E499)
    #[error("Operation exceeded its deadline after {0} ms")]
    Timeout(u64),

    // Store errors (E500-E599)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the stable error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::ObjectNotFound(_) => "E001",
            Self::RelationshipNotFound(_) => "E002",
            Self::BranchNotFound(_) => "E003",
            Self::JobNotFound(_) => "E004",
            Self::Conflict(_) => "E100",
            Self::InvalidInput(_) => "E200",
            Self::LockTimeout(_) => "E300",
            Self::Timeout(_) => "E400",
            Self::DatabaseError(_) => "E500",
            Self::SerializationError(_) => "E501",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Whether retrying the operation may succeed without caller changes
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::LockTimeout(_) | Self::Timeout(_) | Self::DatabaseError(_)
        )
    }
}

/// Map an insert/update error onto the domain taxonomy.
///
/// Unique-constraint violations are surfaced as `Conflict` (stale-head
/// races and duplicate names both land here); everything else stays a
/// database error.
pub(crate) fn map_constraint_err(err: sqlx::Error, what: &str) -> Error {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return Error::Conflict(format!("{what}: concurrent write detected"));
        }
    }
    Error::DatabaseError(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::ObjectNotFound("x".into()).code(), "E001");
        assert_eq!(Error::Conflict("x".into()).code(), "E100");
        assert_eq!(Error::LockTimeout("a:b".into()).code(), "E300");
        assert_eq!(Error::Timeout(100).code(), "E400");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Conflict("stale head".into()).is_retryable());
        assert!(Error::LockTimeout("a:b".into()).is_retryable());
        assert!(!Error::ObjectNotFound("x".into()).is_retryable());
        assert!(!Error::InvalidInput("bad".into()).is_retryable());
    }
}
