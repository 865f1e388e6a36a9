//! Persisted record types.
//!
//! These are the only shapes that cross the storage port. The layout behind
//! the port is opaque; backends only have to round-trip these records
//! losslessly (all of them derive serde with RFC3339 timestamps).
//!
//! # Security
//!
//! - Refresh tokens and short-lived codes are stored as SHA-256 hashes, never
//!   plaintext.
//! - Signing-key material is stored as PEM / base64 in [`KeyMaterial`]; it is
//!   secret and backends must treat the records accordingly.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use keyfort_core::TenantKey;

/// A session as persisted by the session lifecycle manager.
///
/// `handle` is the stable identifier across refreshes. `refresh_token_hash`
/// and `lineage_counter` advance together on every rotation; presenting a
/// refresh token whose counter does not match the stored one (and which is
/// not covered by [`RefreshRetryWindow`]) is treated as token theft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Stable session identifier (UUID).
    pub handle: String,

    /// Tenant this session belongs to.
    pub tenant: TenantKey,

    /// User the session was created for.
    pub user_id: String,

    /// SHA-256 hash of the latest refresh token. The plaintext token is
    /// returned to the client and never stored.
    pub refresh_token_hash: String,

    /// Monotonic rotation counter, starting at 0 on creation.
    pub lineage_counter: u64,

    /// Id of the signing key that signed the latest access token.
    pub access_token_signing_key_id: String,

    /// Anti-CSRF token, present only for cookie-based deployments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anti_csrf_token: Option<String>,

    /// Claims copied verbatim into every access token for this session.
    pub user_data_in_jwt: serde_json::Value,

    /// When the session was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    /// When the session expires (extended on every successful refresh).
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,

    /// Snapshot of the last rotation, used to answer benign retransmits of
    /// the previous refresh token with the identical pair.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_window: Option<RefreshRetryWindow>,
}

impl SessionRecord {
    /// Returns `true` if this session has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }
}

/// Snapshot of the most recent refresh-token rotation.
///
/// When a client retransmits the previous token inside the grace window
/// (a network retry, not theft), the lifecycle manager replays exactly this
/// pair instead of advancing the counter again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRetryWindow {
    /// SHA-256 hash of the refresh token that was rotated out.
    pub prev_refresh_token_hash: String,

    /// The access token issued by that rotation.
    pub access_token: String,

    /// When that access token expires.
    #[serde(with = "time::serde::rfc3339")]
    pub access_token_expires_at: OffsetDateTime,

    /// The refresh token issued by that rotation.
    pub refresh_token: String,

    /// When that refresh token expires.
    #[serde(with = "time::serde::rfc3339")]
    pub refresh_token_expires_at: OffsetDateTime,

    /// When the rotation happened.
    #[serde(with = "time::serde::rfc3339")]
    pub rotated_at: OffsetDateTime,
}

/// Signing algorithm of a persisted key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// RSA with SHA-256; used for access tokens, published via JWKS.
    RS256,
    /// HMAC with SHA-256; used for the static per-app refresh key.
    HS256,
}

impl KeyAlgorithm {
    /// Returns the algorithm name as used in JWT headers.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::HS256 => "HS256",
        }
    }

    /// Returns `true` if this algorithm has a publishable public half.
    #[must_use]
    pub fn is_asymmetric(&self) -> bool {
        matches!(self, Self::RS256)
    }
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Key material, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum KeyMaterial {
    /// PEM-encoded RSA key pair.
    #[serde(rename_all = "camelCase")]
    Rsa {
        /// PKCS#8 PEM private key.
        private_pem: String,
        /// SPKI PEM public key.
        public_pem: String,
    },
    /// Base64url-encoded HMAC secret.
    #[serde(rename_all = "camelCase")]
    Hmac {
        /// The secret bytes, base64url without padding.
        secret: String,
    },
}

/// A signing key as persisted by the signing key manager.
///
/// Dynamic (RS256) keys carry an expiry and rotate; the static refresh key
/// has `expires_at: None` and is never swept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningKeyRecord {
    /// Key id, embedded in token headers as `kid`.
    pub key_id: String,

    /// Signing algorithm.
    pub algorithm: KeyAlgorithm,

    /// The key material.
    pub material: KeyMaterial,

    /// When the key was generated.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    /// When the key stops being valid for verification
    /// (`None` = never expires).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub expires_at: Option<OffsetDateTime>,
}

impl SigningKeyRecord {
    /// Returns `true` if this key has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.map(|exp| now > exp).unwrap_or(false)
    }

    /// Returns `true` if this key is valid for verification at `now`.
    #[must_use]
    pub fn is_valid(&self, now: OffsetDateTime) -> bool {
        !self.is_expired(now)
    }
}

/// Purpose of a short-lived one-time code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CodePurpose {
    /// Password reset token.
    PasswordReset,
    /// Passwordless login code.
    Passwordless,
    /// SAML relay-state code.
    SamlRelay,
}

/// A short-lived one-time code (password reset, passwordless login, SAML
/// relay). The core stores, consumes, and sweeps these; the protocol flows
/// around them live outside the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortLivedCode {
    /// SHA-256 hash of the code value.
    pub code_hash: String,

    /// Tenant the code belongs to.
    pub tenant: TenantKey,

    /// What the code is for.
    pub purpose: CodePurpose,

    /// Flow-specific payload (e.g. the user id being reset).
    pub payload: serde_json::Value,

    /// When the code was issued.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    /// When the code stops being consumable.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl ShortLivedCode {
    /// Returns `true` if this code has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }
}
