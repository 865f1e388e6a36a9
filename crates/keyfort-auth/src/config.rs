//! Session core configuration.
//!
//! Plain serde-deserializable structs; loading them from files or the
//! environment is the embedding process's job. Durations use humantime
//! notation ("15m", "7d") when deserialized from config sources.
//!
//! # Example (TOML)
//!
//! ```toml
//! [sessions]
//! token_transport = "cookie_based"
//! access_token_lifetime = "1h"
//! refresh_token_lifetime = "60d"
//! refresh_grace_window = "30s"
//!
//! [sessions.signing]
//! dynamic_key_validity = "7d"
//! rotation_threshold = "24h"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How tokens travel between client and server.
///
/// This is a deployment-time decision, not a per-request one: cookie
/// transport requires anti-CSRF tokens, header transport ("JWT-only" mode)
/// does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenTransport {
    /// Tokens are carried in cookies; anti-CSRF tokens are issued and
    /// checked on every validation.
    CookieBased,
    /// Tokens are carried in headers; no anti-CSRF token is issued.
    HeaderBased,
}

/// Root session core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Token transport mode (see [`TokenTransport`]).
    pub token_transport: TokenTransport,

    /// Access token lifetime.
    #[serde(with = "humantime_serde")]
    pub access_token_lifetime: Duration,

    /// Refresh token lifetime. Also the session lifetime: each successful
    /// refresh extends the session by this much.
    #[serde(with = "humantime_serde")]
    pub refresh_token_lifetime: Duration,

    /// How long a rotated-out refresh token is still answered with the
    /// previously-issued pair instead of being treated as theft. Covers
    /// network retransmits; set to zero for strict single-use semantics.
    #[serde(with = "humantime_serde")]
    pub refresh_grace_window: Duration,

    /// Tolerated clock skew when verifying token expiry.
    #[serde(with = "humantime_serde")]
    pub clock_skew_tolerance: Duration,

    /// When `true`, `validate_access_token` also checks storage for an
    /// existing session record, so revocation takes effect immediately.
    /// The default keeps validation stateless.
    pub check_revoked_on_validate: bool,

    /// Signing key configuration.
    pub signing: SigningConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_transport: TokenTransport::CookieBased,
            access_token_lifetime: Duration::from_secs(3600), // 1 hour
            refresh_token_lifetime: Duration::from_secs(60 * 24 * 3600), // 60 days
            refresh_grace_window: Duration::from_secs(30),
            clock_skew_tolerance: Duration::from_secs(60),
            check_revoked_on_validate: false,
            signing: SigningConfig::default(),
        }
    }
}

/// Signing key rotation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// How long a dynamic signing key stays valid for verification.
    /// Must exceed `access_token_lifetime + clock_skew_tolerance`, or
    /// legitimately-issued tokens would fail verification after rotation.
    #[serde(with = "humantime_serde")]
    pub dynamic_key_validity: Duration,

    /// When the current key's remaining validity drops below this
    /// threshold, the rotation check generates a successor. Must be shorter
    /// than `dynamic_key_validity`.
    #[serde(with = "humantime_serde")]
    pub rotation_threshold: Duration,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            dynamic_key_validity: Duration::from_secs(7 * 24 * 3600), // 7 days
            rotation_threshold: Duration::from_secs(24 * 3600),       // 24 hours
        }
    }
}

impl AuthConfig {
    /// Validates cross-field numeric policy.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token_lifetime.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "access_token_lifetime",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.refresh_token_lifetime <= self.access_token_lifetime {
            return Err(ConfigError::InvalidValue {
                field: "refresh_token_lifetime",
                reason: "must exceed access_token_lifetime".to_string(),
            });
        }
        let min_validity = self.access_token_lifetime + self.clock_skew_tolerance;
        if self.signing.dynamic_key_validity <= min_validity {
            return Err(ConfigError::InvalidValue {
                field: "signing.dynamic_key_validity",
                reason: format!(
                    "must exceed access_token_lifetime + clock_skew_tolerance ({}s)",
                    min_validity.as_secs()
                ),
            });
        }
        if self.signing.rotation_threshold >= self.signing.dynamic_key_validity {
            return Err(ConfigError::InvalidValue {
                field: "signing.rotation_threshold",
                reason: "must be shorter than signing.dynamic_key_validity".to_string(),
            });
        }
        Ok(())
    }

    /// Safety margin a dynamic key is kept in storage past its expiry:
    /// long enough that any access token it signed has itself expired,
    /// clock skew included.
    #[must_use]
    pub fn key_cleanup_margin(&self) -> Duration {
        self.access_token_lifetime + self.clock_skew_tolerance
    }

    /// Returns `true` if anti-CSRF tokens are issued and enforced.
    #[must_use]
    pub fn anti_csrf_enabled(&self) -> bool {
        self.token_transport == TokenTransport::CookieBased
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field value violates a constraint.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// The offending field.
        field: &'static str,
        /// Why the value is invalid.
        reason: String,
    },
}
