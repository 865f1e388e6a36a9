//! Session core error types.
//!
//! Every operation exposed by this crate returns [`AuthResult`]; nothing
//! panics or throws past the crate boundary. The variants encode both the
//! failure kind and any data the caller needs to act on it — most notably
//! [`AuthError::TokenTheftDetected`], which carries the handle that was
//! revoked and the affected user.

use std::fmt;

use keyfort_storage::StorageError;

/// Type alias for session core results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors surfaced by the Keyfort session core.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The presented credential is invalid: bad signature, expired token,
    /// or failed anti-CSRF check. Never retried.
    #[error("Unauthorised: {message}")]
    Unauthorised {
        /// Description of why the credential was rejected.
        message: String,
    },

    /// A refresh token lineage fork was detected. The session named here has
    /// already been revoked as a side effect; the caller only needs to
    /// surface the failure (and may notify the user).
    #[error("Token theft detected for session {session_handle}")]
    TokenTheftDetected {
        /// The session handle that was revoked.
        session_handle: String,
        /// The user the session belonged to.
        user_id: String,
    },

    /// A refresh referenced a session handle that does not exist.
    #[error("Unknown session: {handle}")]
    UnknownSession {
        /// The handle that was presented.
        handle: String,
    },

    /// A concurrent refresh of the same session won the counter
    /// compare-and-set. The session state is intact; the losing caller must
    /// not retry with its now-consumed token.
    #[error("Concurrent refresh on session {handle}")]
    RefreshConflict {
        /// The contended session handle.
        handle: String,
    },

    /// The tenant has no registered resource bundle.
    #[error("Tenant not found: {tenant}")]
    TenantNotFound {
        /// Display form of the tenant key.
        tenant: String,
    },

    /// The configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// A storage port operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `Unauthorised` error.
    #[must_use]
    pub fn unauthorised(message: impl Into<String>) -> Self {
        Self::Unauthorised {
            message: message.into(),
        }
    }

    /// Creates a new `TokenTheftDetected` error.
    #[must_use]
    pub fn token_theft(session_handle: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::TokenTheftDetected {
            session_handle: session_handle.into(),
            user_id: user_id.into(),
        }
    }

    /// Creates a new `UnknownSession` error.
    #[must_use]
    pub fn unknown_session(handle: impl Into<String>) -> Self {
        Self::UnknownSession {
            handle: handle.into(),
        }
    }

    /// Creates a new `RefreshConflict` error.
    #[must_use]
    pub fn refresh_conflict(handle: impl Into<String>) -> Self {
        Self::RefreshConflict {
            handle: handle.into(),
        }
    }

    /// Creates a new `TenantNotFound` error.
    #[must_use]
    pub fn tenant_not_found(tenant: impl fmt::Display) -> Self {
        Self::TenantNotFound {
            tenant: tenant.to_string(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
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

    /// Returns `true` if this is a security violation (rejected credential
    /// or detected theft). Security violations are never retried.
    #[must_use]
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Unauthorised { .. } | Self::TokenTheftDetected { .. }
        )
    }

    /// Returns `true` if this failure is transient and the whole operation
    /// may be retried by the transport layer.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_unavailable())
    }

    /// Returns `true` if the failure is an absent tenant/session/key.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::UnknownSession { .. } | Self::TenantNotFound { .. } => true,
            Self::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Returns the failure kind for logging/monitoring and for mapping to a
    /// transport-level status.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorised { .. } => ErrorKind::SecurityViolation,
            Self::TokenTheftDetected { .. } => ErrorKind::SecurityViolation,
            Self::UnknownSession { .. } => ErrorKind::NotFound,
            Self::RefreshConflict { .. } => ErrorKind::Conflict,
            Self::TenantNotFound { .. } => ErrorKind::NotFound,
            Self::Configuration { .. } => ErrorKind::Invalid,
            Self::Storage(e) => match e.category() {
                keyfort_storage::ErrorCategory::NotFound => ErrorKind::NotFound,
                keyfort_storage::ErrorCategory::Conflict => ErrorKind::Conflict,
                keyfort_storage::ErrorCategory::Transient => ErrorKind::Transient,
                keyfort_storage::ErrorCategory::Internal => ErrorKind::Internal,
            },
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }
}

/// Failure kinds, one per row of the error-handling taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Tenant/session/key absent; surfaced as a 4xx-equivalent.
    NotFound,
    /// Logical conflict resolved by a specific protocol.
    Conflict,
    /// Transient storage failure; the operation may be retried.
    Transient,
    /// Signature mismatch or detected theft; never retried.
    SecurityViolation,
    /// Invalid input or configuration.
    Invalid,
    /// Internal error.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Transient => write!(f, "transient"),
            Self::SecurityViolation => write!(f, "security_violation"),
            Self::Invalid => write!(f, "invalid"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
