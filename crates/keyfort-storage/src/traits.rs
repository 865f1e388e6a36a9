//! The storage port: the capability trait the core calls for durable state.
//!
//! One implementation exists per backend (`keyfort-db-memory` in this
//! workspace; SQL backends live in their own crates). The core depends only
//! on this trait, always through `Arc<dyn SessionStore>`.
//!
//! # Atomicity
//!
//! Transactional semantics are expressed as atomic conditional operations:
//! [`SessionStore::update_session_if_counter`] is a compare-and-set on the
//! lineage counter and is the enforcement point for refresh linearization;
//! [`SessionStore::insert_signing_key_if_newest`] and
//! [`SessionStore::put_refresh_key_if_absent`] are the optimistic guards that
//! make concurrent key bootstrap/rotation converge, including across
//! processes sharing one backend. Implementations must make each method
//! atomic in isolation; no method may observe another's partial effects.

use async_trait::async_trait;
use time::OffsetDateTime;

use keyfort_core::{AppKey, TenantKey};

use crate::error::StorageError;
use crate::types::{SessionRecord, ShortLivedCode, SigningKeyRecord};

/// Type alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage capability consumed by the Keyfort core.
///
/// All methods may fail with [`StorageError::Unavailable`] on transport
/// failure; that variant (and only that variant) is safe to retry.
#[async_trait]
pub trait SessionStore: Send + Sync {
    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Persists a new session record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] if a record with the same
    /// handle exists.
    async fn create_session(&self, record: &SessionRecord) -> StorageResult<()>;

    /// Fetches a session record by handle.
    ///
    /// Returns records regardless of expiry; callers check
    /// [`SessionRecord::is_expired`].
    async fn get_session(&self, handle: &str) -> StorageResult<Option<SessionRecord>>;

    /// Replaces a session record iff the stored lineage counter equals
    /// `expected_counter`.
    ///
    /// This compare-and-set is the transactional guard for every session
    /// state transition: two concurrent refreshes of the same session cannot
    /// both succeed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CounterConflict`] on counter mismatch and
    /// [`StorageError::NotFound`] if the handle is absent.
    async fn update_session_if_counter(
        &self,
        record: &SessionRecord,
        expected_counter: u64,
    ) -> StorageResult<()>;

    /// Deletes a session record.
    ///
    /// Returns `true` if a record was deleted, `false` if the handle was
    /// already absent (revocation is idempotent).
    async fn delete_session(&self, handle: &str) -> StorageResult<bool>;

    /// Lists the handles of all sessions belonging to a user in a tenant.
    async fn session_handles_for_user(
        &self,
        tenant: &TenantKey,
        user_id: &str,
    ) -> StorageResult<Vec<String>>;

    /// Deletes all sessions whose `expires_at` is before `before`.
    ///
    /// Returns the number of records deleted.
    async fn delete_expired_sessions(&self, before: OffsetDateTime) -> StorageResult<u64>;

    // ------------------------------------------------------------------
    // Signing keys
    // ------------------------------------------------------------------

    /// Returns all dynamic signing keys for an app, newest first.
    async fn signing_keys(&self, app: &AppKey) -> StorageResult<Vec<SigningKeyRecord>>;

    /// Inserts a dynamic signing key iff the caller's view of the newest key
    /// is still accurate.
    ///
    /// `expected_newest` is the id of the newest key the caller observed
    /// (`None` when it observed no keys). Concurrent bootstraps/rotations
    /// race on this guard; the loser receives a conflict, reloads, and
    /// adopts the winner's key.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Constraint`] when the newest key no longer
    /// matches `expected_newest`, and [`StorageError::AlreadyExists`] on a
    /// duplicate key id.
    async fn insert_signing_key_if_newest(
        &self,
        app: &AppKey,
        key: &SigningKeyRecord,
        expected_newest: Option<&str>,
    ) -> StorageResult<()>;

    /// Deletes dynamic signing keys whose expiry is before `expired_before`,
    /// excluding the key id in `keep` regardless of its expiry.
    ///
    /// Returns the number of keys deleted.
    async fn delete_signing_keys(
        &self,
        app: &AppKey,
        expired_before: OffsetDateTime,
        keep: Option<&str>,
    ) -> StorageResult<u64>;

    /// Returns the static refresh-token key for an app, if one exists.
    async fn refresh_key(&self, app: &AppKey) -> StorageResult<Option<SigningKeyRecord>>;

    /// Stores `key` as the app's static refresh key unless one already
    /// exists, returning whichever record is stored afterwards.
    ///
    /// Concurrent bootstraps converge: exactly one caller's key wins and
    /// every caller receives the winner.
    async fn put_refresh_key_if_absent(
        &self,
        app: &AppKey,
        key: &SigningKeyRecord,
    ) -> StorageResult<SigningKeyRecord>;

    // ------------------------------------------------------------------
    // Short-lived codes
    // ------------------------------------------------------------------

    /// Persists a one-time code.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] on a duplicate code hash
    /// within the tenant.
    async fn put_code(&self, code: &ShortLivedCode) -> StorageResult<()>;

    /// Atomically removes and returns a code, if present.
    ///
    /// A code can be taken exactly once; concurrent consumers see at most
    /// one `Some`.
    async fn take_code(
        &self,
        tenant: &TenantKey,
        code_hash: &str,
    ) -> StorageResult<Option<ShortLivedCode>>;

    /// Deletes all codes whose `expires_at` is before `before`.
    ///
    /// Returns the number of codes deleted.
    async fn delete_expired_codes(&self, before: OffsetDateTime) -> StorageResult<u64>;

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Releases any resources held by this store (e.g. pooled connections).
    ///
    /// Called by the registry when the last tenant using this store is
    /// removed. Default is a no-op for backends without pooled state.
    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Short backend name for logging.
    fn backend_name(&self) -> &'static str;
}
