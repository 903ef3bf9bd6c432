//! Resolver Error Types
//!
//! Unified error handling for descriptors, planning, execution and
//! transactions. Every public operation returns `ResolverResult`.

use thiserror::Error;

/// Resolver result type
pub type ResolverResult<T> = Result<T, ResolverError>;

/// Resolver error type
///
/// `Clone` so that a single batched load can hand the same outcome to every
/// waiter.
#[derive(Debug, Clone, Error)]
pub enum ResolverError {
    /// Required single-result read yielded nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed or contradictory request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Delete blocked by a restrict policy
    #[error("Restricted: {0}")]
    Restricted(String),

    /// Field rule violation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Opaque failure reported by a backing store
    #[error("Driver failure: {0}")]
    Driver(String),

    /// Schema or configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rollback handle failed while undoing queued work
    #[error("Rollback failed: {rollback}{}", cause_suffix(.cause))]
    RollbackFailed {
        cause: Option<Box<ResolverError>>,
        rollback: Box<ResolverError>,
    },
}

impl ResolverError {
    /// Create a not found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Create a bad request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a restricted error
    pub fn restricted(msg: impl Into<String>) -> Self {
        Self::Restricted(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a driver error
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap a rollback failure, keeping the error that triggered the rollback
    pub fn rollback_failed(cause: Option<ResolverError>, rollback: ResolverError) -> Self {
        Self::RollbackFailed {
            cause: cause.map(Box::new),
            rollback: Box::new(rollback),
        }
    }

    /// Attach the triggering error to a rollback failure that has none yet.
    /// Any other error is returned unchanged.
    pub fn with_cause(self, cause: ResolverError) -> Self {
        match self {
            Self::RollbackFailed {
                cause: None,
                rollback,
            } => Self::RollbackFailed {
                cause: Some(Box::new(cause)),
                rollback,
            },
            other => other,
        }
    }

    /// Get error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Restricted(_) => "RESTRICTED",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::Driver(_) => "DRIVER_FAILURE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::RollbackFailed { .. } => "ROLLBACK_FAILED",
        }
    }

    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::BadRequest(_) => 400,
            Self::Restricted(_) => 409,
            Self::Validation(_) => 400,
            Self::Driver(_) => 500,
            Self::Config(_) => 500,
            Self::RollbackFailed { .. } => 500,
        }
    }

    /// Client errors are never retried by the resolver
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::BadRequest(_) | Self::Restricted(_) | Self::Validation(_)
        )
    }
}

fn cause_suffix(cause: &Option<Box<ResolverError>>) -> String {
    cause
        .as_ref()
        .map(|c| format!(" (while handling: {})", c))
        .unwrap_or_default()
}

impl From<serde_json::Error> for ResolverError {
    fn from(e: serde_json::Error) -> Self {
        Self::BadRequest(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ResolverError::not_found("Person").status_code(), 404);
        assert_eq!(ResolverError::restricted("Person").status_code(), 409);
        assert_eq!(ResolverError::driver("boom").status_code(), 500);
    }

    #[test]
    fn test_client_errors() {
        assert!(ResolverError::validation("x").is_client_error());
        assert!(ResolverError::bad_request("x").is_client_error());
        assert!(!ResolverError::driver("x").is_client_error());
    }

    #[test]
    fn test_rollback_failure_keeps_cause() {
        let err = ResolverError::rollback_failed(None, ResolverError::driver("undo failed"))
            .with_cause(ResolverError::driver("write failed"));

        assert_eq!(err.code(), "ROLLBACK_FAILED");
        let msg = err.to_string();
        assert!(msg.contains("undo failed"));
        assert!(msg.contains("write failed"));
    }

    #[test]
    fn test_with_cause_leaves_other_errors() {
        let err = ResolverError::not_found("Person").with_cause(ResolverError::driver("x"));
        assert!(matches!(err, ResolverError::NotFound(_)));
    }
}
