//! Session lifecycle management.
//!
//! The state machine per session handle is
//! `CREATED -> ACTIVE -> (REFRESHED)* -> REVOKED | EXPIRED`, with every
//! transition guarded by the storage port's compare-and-set on the lineage
//! counter.
//!
//! # Lineage and theft detection
//!
//! Each refresh token embeds its session handle and a monotonic lineage
//! counter. A successful refresh stores the new token's hash and counter+1,
//! and snapshots the issued pair into the record's retry window. A later
//! presentation of the rotated-out token is then either
//!
//! - a benign retransmit (it matches the retry window and arrived inside
//!   the configured grace window): answered with the identical counter+1
//!   pair, no state advances; or
//! - a fork of the lineage (anything else): the session is revoked first,
//!   then [`AuthError::TokenTheftDetected`] is returned carrying the handle
//!   and user id.
//!
//! Two concurrent refreshes presenting the same token are linearized by the
//! storage CAS: exactly one advances the counter. The loser re-reads the
//! record and fails with [`AuthError::RefreshConflict`] when the winner
//! consumed the same token, or with theft detection when the lineage truly
//! forked. The grace window applies to sequential retransmits, which arrive
//! after the winner's response and hit the retry-window path.

mod info;

pub use info::{SessionClaims, SessionInfo, SessionInformationHolder, TokenInfo};

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use keyfort_core::{TenantKey, generate_handle, generate_opaque_token, now_utc};
use keyfort_storage::{
    RefreshRetryWindow, SessionRecord, SessionStore, StorageError,
};

use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::jwt::{AccessTokenClaims, JwtError, RefreshTokenClaims, hash_token};
use crate::keys::{SessionKey, SigningKeyManager};

/// Session lifecycle manager for one tenant.
///
/// Cheap to construct (a handful of `Arc` clones); the facade builds one
/// per resolved tenant call.
pub struct SessionManager {
    tenant: TenantKey,
    storage: Arc<dyn SessionStore>,
    keys: Arc<SigningKeyManager>,
    config: Arc<AuthConfig>,
}

impl SessionManager {
    /// Creates a manager over a tenant's storage and its app's key manager.
    #[must_use]
    pub fn new(
        tenant: TenantKey,
        storage: Arc<dyn SessionStore>,
        keys: Arc<SigningKeyManager>,
        config: Arc<AuthConfig>,
    ) -> Self {
        Self {
            tenant,
            storage,
            keys,
            config,
        }
    }

    fn leeway_secs(&self) -> u64 {
        self.config.clock_skew_tolerance.as_secs()
    }

    /// Creates a new session for a user.
    ///
    /// Signs an access token with the app's current signing key, issues a
    /// refresh token at lineage counter 0, and persists the record with the
    /// refresh token stored as a hash. The anti-CSRF token is present
    /// exactly when the deployment uses cookie transport.
    pub async fn create_session(
        &self,
        user_id: &str,
        user_data: serde_json::Value,
    ) -> AuthResult<SessionInformationHolder> {
        let now = now_utc();
        let handle = generate_handle();
        let anti_csrf = self
            .config
            .anti_csrf_enabled()
            .then(generate_opaque_token);

        let (refresh_token, refresh_expires) = self.issue_refresh_token(&handle, 0, now).await?;
        let (access_token, access_expires, signing_key_id) = self
            .issue_access_token(&handle, user_id, &user_data, anti_csrf.as_deref(), now)
            .await?;

        let record = SessionRecord {
            handle: handle.clone(),
            tenant: self.tenant.clone(),
            user_id: user_id.to_string(),
            refresh_token_hash: hash_token(&refresh_token),
            lineage_counter: 0,
            access_token_signing_key_id: signing_key_id,
            anti_csrf_token: anti_csrf.clone(),
            user_data_in_jwt: user_data.clone(),
            created_at: now,
            expires_at: refresh_expires,
            retry_window: None,
        };
        self.storage.create_session(&record).await?;

        info!(tenant = %self.tenant, handle = %handle, "created session");
        Ok(SessionInformationHolder {
            session: SessionInfo {
                handle,
                user_id: user_id.to_string(),
                user_data,
            },
            access_token: TokenInfo {
                token: access_token,
                expires_at: access_expires,
                created_at: now,
            },
            refresh_token: TokenInfo {
                token: refresh_token,
                expires_at: refresh_expires,
                created_at: now,
            },
            anti_csrf_token: anti_csrf,
        })
    }

    /// Refreshes a session with a presented refresh token.
    ///
    /// See the module docs for the lineage/theft/grace rules.
    pub async fn refresh_session(
        &self,
        presented: &str,
    ) -> AuthResult<SessionInformationHolder> {
        let refresh_key = self.keys.refresh_signing_key().await?;
        let claims: RefreshTokenClaims = refresh_key
            .pair
            .verify(presented, self.leeway_secs())
            .map_err(|e| unauthorised_from_jwt("refresh token", e))?;

        let now = now_utc();
        let presented_hash = hash_token(presented);

        let record = self
            .storage
            .get_session(&claims.session_handle)
            .await?
            .ok_or_else(|| AuthError::unknown_session(&claims.session_handle))?;

        if record.is_expired(now) {
            return Err(AuthError::unauthorised("session has expired"));
        }

        if presented_hash == record.refresh_token_hash
            && claims.lineage_counter == record.lineage_counter
        {
            return self.rotate(record, presented_hash, now).await;
        }

        if let Some(replay) = self.try_replay(&record, &presented_hash, &claims, now) {
            return Ok(replay);
        }

        // The lineage has forked: the presented token was consumed earlier
        // and is outside the grace window, or never belonged to this chain.
        self.revoke_for_theft(&record).await
    }

    /// Rotates the session to counter+1 under the storage CAS.
    async fn rotate(
        &self,
        record: SessionRecord,
        presented_hash: String,
        now: OffsetDateTime,
    ) -> AuthResult<SessionInformationHolder> {
        let next_counter = record.lineage_counter + 1;
        let anti_csrf = self
            .config
            .anti_csrf_enabled()
            .then(generate_opaque_token);

        let (refresh_token, refresh_expires) = self
            .issue_refresh_token(&record.handle, next_counter, now)
            .await?;
        // Re-signed with the current signing key, which may differ from the
        // key used at creation.
        let (access_token, access_expires, signing_key_id) = self
            .issue_access_token(
                &record.handle,
                &record.user_id,
                &record.user_data_in_jwt,
                anti_csrf.as_deref(),
                now,
            )
            .await?;

        let updated = SessionRecord {
            refresh_token_hash: hash_token(&refresh_token),
            lineage_counter: next_counter,
            access_token_signing_key_id: signing_key_id,
            anti_csrf_token: anti_csrf.clone(),
            expires_at: refresh_expires,
            retry_window: Some(RefreshRetryWindow {
                prev_refresh_token_hash: presented_hash.clone(),
                access_token: access_token.clone(),
                access_token_expires_at: access_expires,
                refresh_token: refresh_token.clone(),
                refresh_token_expires_at: refresh_expires,
                rotated_at: now,
            }),
            ..record.clone()
        };

        match self
            .storage
            .update_session_if_counter(&updated, record.lineage_counter)
            .await
        {
            Ok(()) => Ok(SessionInformationHolder {
                session: SessionInfo {
                    handle: updated.handle,
                    user_id: updated.user_id,
                    user_data: updated.user_data_in_jwt,
                },
                access_token: TokenInfo {
                    token: access_token,
                    expires_at: access_expires,
                    created_at: now,
                },
                refresh_token: TokenInfo {
                    token: refresh_token,
                    expires_at: refresh_expires,
                    created_at: now,
                },
                anti_csrf_token: anti_csrf,
            }),
            Err(StorageError::CounterConflict { .. }) => {
                // A concurrent refresh won the CAS. Re-read: if the winner
                // consumed this same presented token, report the conflict
                // without touching the session — the winner's response
                // carries the valid pair. Anything else is a fork.
                let current = self
                    .storage
                    .get_session(&record.handle)
                    .await?
                    .ok_or_else(|| AuthError::unknown_session(&record.handle))?;
                let same_token_won = current
                    .retry_window
                    .as_ref()
                    .is_some_and(|w| w.prev_refresh_token_hash == presented_hash);
                if same_token_won {
                    return Err(AuthError::refresh_conflict(&current.handle));
                }
                self.revoke_for_theft(&current).await
            }
            Err(StorageError::NotFound { .. }) => {
                Err(AuthError::unknown_session(&record.handle))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replay check for a token that is exactly one rotation behind.
    fn try_replay(
        &self,
        record: &SessionRecord,
        presented_hash: &str,
        claims: &RefreshTokenClaims,
        now: OffsetDateTime,
    ) -> Option<SessionInformationHolder> {
        if claims.lineage_counter + 1 != record.lineage_counter {
            return None;
        }
        self.replay_from_window(record, presented_hash, now)
    }

    fn replay_from_window(
        &self,
        record: &SessionRecord,
        presented_hash: &str,
        now: OffsetDateTime,
    ) -> Option<SessionInformationHolder> {
        let window = record.retry_window.as_ref()?;
        if window.prev_refresh_token_hash != presented_hash {
            return None;
        }
        let grace = time::Duration::try_from(self.config.refresh_grace_window)
            .unwrap_or(time::Duration::ZERO);
        if now - window.rotated_at > grace {
            return None;
        }

        info!(
            tenant = %self.tenant,
            handle = %record.handle,
            "answered refresh retransmit from retry window"
        );
        Some(SessionInformationHolder {
            session: SessionInfo {
                handle: record.handle.clone(),
                user_id: record.user_id.clone(),
                user_data: record.user_data_in_jwt.clone(),
            },
            access_token: TokenInfo {
                token: window.access_token.clone(),
                expires_at: window.access_token_expires_at,
                created_at: window.rotated_at,
            },
            refresh_token: TokenInfo {
                token: window.refresh_token.clone(),
                expires_at: window.refresh_token_expires_at,
                created_at: window.rotated_at,
            },
            anti_csrf_token: record.anti_csrf_token.clone(),
        })
    }

    /// Revokes the session and returns the theft error carrying the handle
    /// and user id. The revoke happens before the error is returned; if
    /// storage fails the storage error propagates instead so the transport
    /// retries and theft is re-detected.
    async fn revoke_for_theft(&self, record: &SessionRecord) -> AuthResult<SessionInformationHolder> {
        self.storage.delete_session(&record.handle).await?;
        warn!(
            tenant = %self.tenant,
            handle = %record.handle,
            user_id = %record.user_id,
            "token theft detected, session revoked"
        );
        Err(AuthError::token_theft(&record.handle, &record.user_id))
    }

    /// Verifies an access token and returns its claims.
    ///
    /// Stateless by default: signature against any currently-valid signing
    /// key plus expiry. Storage is consulted only when
    /// `check_revoked_on_validate` is enabled.
    pub async fn validate_access_token(
        &self,
        token: &str,
        anti_csrf: Option<&str>,
    ) -> AuthResult<SessionClaims> {
        let kid = crate::jwt::token_kid(token)
            .map_err(|e| unauthorised_from_jwt("access token", e))?
            .ok_or_else(|| AuthError::unauthorised("access token has no key id"))?;

        let key: Arc<SessionKey> = self
            .keys
            .key_by_id(&kid)
            .await?
            .ok_or_else(|| AuthError::unauthorised("access token signed by unknown key"))?;

        let claims: AccessTokenClaims = key
            .pair
            .verify(token, self.leeway_secs())
            .map_err(|e| unauthorised_from_jwt("access token", e))?;

        if claims.tenant_id != self.tenant.tenant_id {
            return Err(AuthError::unauthorised(
                "access token was issued for a different tenant",
            ));
        }

        if self.config.anti_csrf_enabled() {
            let expected = claims.anti_csrf_token.as_deref();
            if expected.is_none() || expected != anti_csrf {
                return Err(AuthError::unauthorised("anti-csrf check failed"));
            }
        }

        if self.config.check_revoked_on_validate {
            let record = self.storage.get_session(&claims.session_handle).await?;
            match record {
                Some(r) if !r.is_expired(now_utc()) => {}
                _ => return Err(AuthError::unauthorised("session has been revoked")),
            }
        }

        Ok(SessionClaims {
            handle: claims.session_handle,
            user_id: claims.sub,
            tenant_id: claims.tenant_id,
            user_data: claims.user_data,
            expires_at: OffsetDateTime::from_unix_timestamp(claims.exp)
                .map_err(|e| AuthError::internal(format!("invalid exp claim: {e}")))?,
            signing_key_id: kid,
        })
    }

    /// Revokes a session. Idempotent: revoking an absent handle returns
    /// `Ok(false)`.
    pub async fn revoke_session(&self, handle: &str) -> AuthResult<bool> {
        let deleted = self.storage.delete_session(handle).await?;
        if deleted {
            info!(tenant = %self.tenant, handle = %handle, "revoked session");
        }
        Ok(deleted)
    }

    /// Revokes every session of a user within this tenant, returning the
    /// number of sessions revoked.
    pub async fn revoke_all_for_user(&self, user_id: &str) -> AuthResult<u64> {
        let handles = self
            .storage
            .session_handles_for_user(&self.tenant, user_id)
            .await?;
        let mut revoked = 0u64;
        for handle in handles {
            if self.storage.delete_session(&handle).await? {
                revoked += 1;
            }
        }
        if revoked > 0 {
            info!(tenant = %self.tenant, user_id = %user_id, revoked, "revoked user sessions");
        }
        Ok(revoked)
    }

    async fn issue_refresh_token(
        &self,
        handle: &str,
        lineage_counter: u64,
        now: OffsetDateTime,
    ) -> AuthResult<(String, OffsetDateTime)> {
        let refresh_key = self.keys.refresh_signing_key().await?;
        let expires = now + self.config.refresh_token_lifetime;
        let claims = RefreshTokenClaims {
            exp: expires.unix_timestamp(),
            iat: now.unix_timestamp(),
            session_handle: handle.to_string(),
            lineage_counter,
            jti: Uuid::new_v4().to_string(),
        };
        let token = refresh_key
            .pair
            .sign(&claims)
            .map_err(|e| AuthError::internal(format!("failed to sign refresh token: {e}")))?;
        Ok((token, expires))
    }

    async fn issue_access_token(
        &self,
        handle: &str,
        user_id: &str,
        user_data: &serde_json::Value,
        anti_csrf: Option<&str>,
        now: OffsetDateTime,
    ) -> AuthResult<(String, OffsetDateTime, String)> {
        let key = self.keys.current_signing_key().await?;
        let expires = now + self.config.access_token_lifetime;
        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            exp: expires.unix_timestamp(),
            iat: now.unix_timestamp(),
            session_handle: handle.to_string(),
            tenant_id: self.tenant.tenant_id.clone(),
            user_data: user_data.clone(),
            anti_csrf_token: anti_csrf.map(str::to_string),
        };
        let token = key
            .pair
            .sign(&claims)
            .map_err(|e| AuthError::internal(format!("failed to sign access token: {e}")))?;
        Ok((token, expires, key.kid().to_string()))
    }
}

fn unauthorised_from_jwt(what: &str, e: JwtError) -> AuthError {
    match e {
        JwtError::Expired => AuthError::unauthorised(format!("{what} expired")),
        JwtError::InvalidSignature => {
            AuthError::unauthorised(format!("{what} signature verification failed"))
        }
        JwtError::DecodingError { message } => {
            AuthError::unauthorised(format!("malformed {what}: {message}"))
        }
        other => AuthError::internal(format!("{what} verification error: {other}")),
    }
}
