//! Error taxonomy for the release engine.
//!
//! Every failure the engine reports leaves storage exactly as it was before the call, except
//! [`ReleaseError::Storage`], where the backend itself failed and the outcome is unknown.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReleaseError {
    /// A referenced release, object or snapshot does not exist where existence was required
    #[error("not found: {0}")]
    NotFound(String),

    /// Publish attempted with zero pending changes
    #[error("release {0} has no pending changes to publish")]
    NoChanges(String),

    /// An invariant would be broken (duplicate snapshot, second current release, cycle, ...)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Unknown entity kind, or a reference to an entity that does not exist
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// Syntax payload is missing required keys or has the wrong shape
    #[error("invalid syntax: {0}")]
    Validation(String),

    /// The dynamic-table collaborator failed; the publish was rolled back
    #[error("schema migration failed: {0}")]
    MigrationFailure(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ReleaseError {
    /// True when the failed call changed nothing and may simply be retried or corrected.
    pub fn is_retry_safe(&self) -> bool {
        !matches!(self, ReleaseError::Storage(_))
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        ReleaseError::NotFound(what.to_string())
    }

    pub fn constraint(what: impl std::fmt::Display) -> Self {
        ReleaseError::ConstraintViolation(what.to_string())
    }
}

impl From<sqlx::Error> for ReleaseError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            return ReleaseError::ConstraintViolation(err.to_string());
        }
        ReleaseError::Storage(err.into())
    }
}

impl From<serde_json::Error> for ReleaseError {
    fn from(err: serde_json::Error) -> Self {
        ReleaseError::Storage(err.into())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "23505").unwrap_or(false);
    }
    false
}

pub type Result<T> = std::result::Result<T, ReleaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_storage_errors_are_unsafe_to_retry() {
        assert!(ReleaseError::NoChanges("0.1.0".to_string()).is_retry_safe());
        assert!(ReleaseError::MigrationFailure("boom".to_string()).is_retry_safe());
        assert!(ReleaseError::constraint("dup").is_retry_safe());
        assert!(!ReleaseError::Storage(anyhow::anyhow!("connection reset")).is_retry_safe());
    }

    #[test]
    fn test_error_messages() {
        let err = ReleaseError::not_found("release AAAA1");
        assert_eq!(err.to_string(), "not found: release AAAA1");
    }
}
