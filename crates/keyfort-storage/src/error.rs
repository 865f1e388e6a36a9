//! Storage error types for the Keyfort storage abstraction layer.
//!
//! The taxonomy draws one line that every caller depends on: transport-level
//! failure ([`StorageError::Unavailable`], safe to retry the whole operation)
//! versus logical outcomes (`NotFound`, `AlreadyExists`, `CounterConflict`,
//! `Constraint`) that are resolved by the calling protocol, never by retry.

use std::fmt;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested record was not found.
    #[error("Record not found: {kind}/{id}")]
    NotFound {
        /// The kind of record that was not found (e.g. "session").
        kind: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Attempted to create a record that already exists.
    #[error("Record already exists: {kind}/{id}")]
    AlreadyExists {
        /// The kind of record that already exists.
        kind: String,
        /// The identifier of the existing record.
        id: String,
    },

    /// A compare-and-set on a session's lineage counter failed.
    #[error("Lineage counter conflict: expected {expected}, found {actual}")]
    CounterConflict {
        /// The counter value the caller expected to find.
        expected: u64,
        /// The counter value actually stored.
        actual: u64,
    },

    /// A logical uniqueness or ordering constraint was violated.
    #[error("Constraint violation: {message}")]
    Constraint {
        /// Description of the violated constraint.
        message: String,
    },

    /// The storage backend could not be reached or timed out.
    ///
    /// This is the only retryable variant: every port operation is either
    /// read-only or atomic, so the caller may safely re-run it.
    #[error("Storage unavailable: {message}")]
    Unavailable {
        /// Description of the transport failure.
        message: String,
    },

    /// An internal storage error occurred.
    #[error("Internal storage error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Creates a new `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Creates a new `CounterConflict` error.
    #[must_use]
    pub fn counter_conflict(expected: u64, actual: u64) -> Self {
        Self::CounterConflict { expected, actual }
    }

    /// Creates a new `Constraint` error.
    #[must_use]
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint {
            message: message.into(),
        }
    }

    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is a logical conflict (constraint violation,
    /// duplicate insert, or failed compare-and-set).
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists { .. } | Self::CounterConflict { .. } | Self::Constraint { .. }
        )
    }

    /// Returns `true` if this is a transport-level failure that the caller
    /// may retry.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AlreadyExists { .. } => ErrorCategory::Conflict,
            Self::CounterConflict { .. } => ErrorCategory::Conflict,
            Self::Constraint { .. } => ErrorCategory::Conflict,
            Self::Unavailable { .. } => ErrorCategory::Transient,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

/// Categories of storage errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Record not found.
    NotFound,
    /// Logical conflict (duplicate, constraint, failed compare-and-set).
    Conflict,
    /// Transient transport failure.
    Transient,
    /// Internal error.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Transient => write!(f, "transient"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::not_found("session", "abc");
        assert_eq!(err.to_string(), "Record not found: session/abc");

        let err = StorageError::counter_conflict(3, 4);
        assert_eq!(
            err.to_string(),
            "Lineage counter conflict: expected 3, found 4"
        );

        let err = StorageError::unavailable("connection refused");
        assert_eq!(err.to_string(), "Storage unavailable: connection refused");
    }

    #[test]
    fn test_error_predicates() {
        assert!(StorageError::not_found("session", "abc").is_not_found());
        assert!(!StorageError::not_found("session", "abc").is_conflict());

        assert!(StorageError::counter_conflict(1, 2).is_conflict());
        assert!(StorageError::already_exists("key", "k1").is_conflict());
        assert!(StorageError::constraint("stale view").is_conflict());

        assert!(StorageError::unavailable("timeout").is_unavailable());
        assert!(!StorageError::unavailable("timeout").is_conflict());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            StorageError::not_found("session", "abc").category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            StorageError::counter_conflict(1, 2).category(),
            ErrorCategory::Conflict
        );
        assert_eq!(
            StorageError::unavailable("timeout").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            StorageError::internal("boom").category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::NotFound.to_string(), "not_found");
        assert_eq!(ErrorCategory::Conflict.to_string(), "conflict");
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
        assert_eq!(ErrorCategory::Internal.to_string(), "internal");
    }
}
