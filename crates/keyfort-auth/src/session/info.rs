//! Session result types returned across the API surface.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A token together with its validity window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    /// The token value.
    pub token: String,

    /// When the token expires.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,

    /// When the token was issued.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Identity of a session, stable across refreshes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// The session handle.
    pub handle: String,

    /// The user the session belongs to.
    pub user_id: String,

    /// Claims embedded in every access token of this session.
    pub user_data: serde_json::Value,
}

/// Everything a transport layer needs after creating or refreshing a
/// session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInformationHolder {
    /// The session identity.
    pub session: SessionInfo,

    /// The freshly-signed access token.
    pub access_token: TokenInfo,

    /// The freshly-issued refresh token.
    pub refresh_token: TokenInfo,

    /// Anti-CSRF pair token (cookie transport only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anti_csrf_token: Option<String>,
}

/// Verified claims of an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    /// The session handle.
    pub handle: String,

    /// The user the token was issued to.
    pub user_id: String,

    /// The tenant the session was created in.
    pub tenant_id: String,

    /// Claims embedded at issue time.
    pub user_data: serde_json::Value,

    /// Token expiry.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,

    /// Id of the key that signed the token.
    pub signing_key_id: String,
}
