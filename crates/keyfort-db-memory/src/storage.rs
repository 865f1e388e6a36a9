use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use keyfort_core::{AppKey, TenantKey};
use keyfort_storage::{
    SessionRecord, SessionStore, ShortLivedCode, SigningKeyRecord, StorageError, StorageResult,
};

#[derive(Default)]
struct State {
    sessions: HashMap<String, SessionRecord>,
    signing_keys: HashMap<AppKey, Vec<SigningKeyRecord>>,
    refresh_keys: HashMap<AppKey, SigningKeyRecord>,
    codes: HashMap<(TenantKey, String), ShortLivedCode>,
}

/// In-memory storage backend.
///
/// Conditional operations take the write lock for their full duration, so
/// each method is atomic in isolation. [`MemoryStore::set_unavailable`]
/// simulates a transport outage: while enabled, every operation fails with
/// [`StorageError::Unavailable`], which is how the scheduler and transport
/// retry paths are exercised in tests.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles simulated transport failure.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::unavailable("in-memory store offline"))
        } else {
            Ok(())
        }
    }

    fn newest_key_id(keys: &[SigningKeyRecord]) -> Option<&str> {
        keys.iter()
            .max_by_key(|k| k.created_at)
            .map(|k| k.key_id.as_str())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, record: &SessionRecord) -> StorageResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if state.sessions.contains_key(&record.handle) {
            return Err(StorageError::already_exists("session", &record.handle));
        }
        state.sessions.insert(record.handle.clone(), record.clone());
        Ok(())
    }

    async fn get_session(&self, handle: &str) -> StorageResult<Option<SessionRecord>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.sessions.get(handle).cloned())
    }

    async fn update_session_if_counter(
        &self,
        record: &SessionRecord,
        expected_counter: u64,
    ) -> StorageResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let stored = state
            .sessions
            .get_mut(&record.handle)
            .ok_or_else(|| StorageError::not_found("session", &record.handle))?;
        if stored.lineage_counter != expected_counter {
            return Err(StorageError::counter_conflict(
                expected_counter,
                stored.lineage_counter,
            ));
        }
        *stored = record.clone();
        Ok(())
    }

    async fn delete_session(&self, handle: &str) -> StorageResult<bool> {
        self.check_available()?;
        let mut state = self.state.write().await;
        Ok(state.sessions.remove(handle).is_some())
    }

    async fn session_handles_for_user(
        &self,
        tenant: &TenantKey,
        user_id: &str,
    ) -> StorageResult<Vec<String>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.tenant == *tenant && s.user_id == user_id)
            .map(|s| s.handle.clone())
            .collect())
    }

    async fn delete_expired_sessions(&self, before: OffsetDateTime) -> StorageResult<u64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let initial = state.sessions.len();
        state.sessions.retain(|_, s| s.expires_at >= before);
        Ok((initial - state.sessions.len()) as u64)
    }

    async fn signing_keys(&self, app: &AppKey) -> StorageResult<Vec<SigningKeyRecord>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut keys = state.signing_keys.get(app).cloned().unwrap_or_default();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn insert_signing_key_if_newest(
        &self,
        app: &AppKey,
        key: &SigningKeyRecord,
        expected_newest: Option<&str>,
    ) -> StorageResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let keys = state.signing_keys.entry(app.clone()).or_default();

        if keys.iter().any(|k| k.key_id == key.key_id) {
            return Err(StorageError::already_exists("signing_key", &key.key_id));
        }
        let newest = Self::newest_key_id(keys);
        if newest != expected_newest {
            return Err(StorageError::constraint(format!(
                "newest signing key for {app} is {:?}, caller expected {:?}",
                newest, expected_newest
            )));
        }
        keys.push(key.clone());
        Ok(())
    }

    async fn delete_signing_keys(
        &self,
        app: &AppKey,
        expired_before: OffsetDateTime,
        keep: Option<&str>,
    ) -> StorageResult<u64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let Some(keys) = state.signing_keys.get_mut(app) else {
            return Ok(0);
        };
        let initial = keys.len();
        keys.retain(|k| {
            keep == Some(k.key_id.as_str())
                || k.expires_at.map(|exp| exp >= expired_before).unwrap_or(true)
        });
        Ok((initial - keys.len()) as u64)
    }

    async fn refresh_key(&self, app: &AppKey) -> StorageResult<Option<SigningKeyRecord>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.refresh_keys.get(app).cloned())
    }

    async fn put_refresh_key_if_absent(
        &self,
        app: &AppKey,
        key: &SigningKeyRecord,
    ) -> StorageResult<SigningKeyRecord> {
        self.check_available()?;
        let mut state = self.state.write().await;
        Ok(state
            .refresh_keys
            .entry(app.clone())
            .or_insert_with(|| key.clone())
            .clone())
    }

    async fn put_code(&self, code: &ShortLivedCode) -> StorageResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let key = (code.tenant.clone(), code.code_hash.clone());
        if state.codes.contains_key(&key) {
            return Err(StorageError::already_exists("code", &code.code_hash));
        }
        state.codes.insert(key, code.clone());
        Ok(())
    }

    async fn take_code(
        &self,
        tenant: &TenantKey,
        code_hash: &str,
    ) -> StorageResult<Option<ShortLivedCode>> {
        self.check_available()?;
        let mut state = self.state.write().await;
        Ok(state.codes.remove(&(tenant.clone(), code_hash.to_string())))
    }

    async fn delete_expired_codes(&self, before: OffsetDateTime) -> StorageResult<u64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let initial = state.codes.len();
        state.codes.retain(|_, c| c.expires_at >= before);
        Ok((initial - state.codes.len()) as u64)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyfort_core::now_utc;
    use keyfort_storage::{CodePurpose, KeyAlgorithm, KeyMaterial};
    use time::Duration;

    fn session(handle: &str, user: &str, expires_in: Duration) -> SessionRecord {
        let now = now_utc();
        SessionRecord {
            handle: handle.to_string(),
            tenant: TenantKey::base(),
            user_id: user.to_string(),
            refresh_token_hash: "ab".repeat(32),
            lineage_counter: 0,
            access_token_signing_key_id: "kid-1".to_string(),
            anti_csrf_token: None,
            user_data_in_jwt: serde_json::json!({}),
            created_at: now,
            expires_at: now + expires_in,
            retry_window: None,
        }
    }

    fn dynamic_key(id: &str, created_offset: Duration, validity: Duration) -> SigningKeyRecord {
        let created = now_utc() + created_offset;
        SigningKeyRecord {
            key_id: id.to_string(),
            algorithm: KeyAlgorithm::RS256,
            material: KeyMaterial::Rsa {
                private_pem: "priv".to_string(),
                public_pem: "pub".to_string(),
            },
            created_at: created,
            expires_at: Some(created + validity),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let store = MemoryStore::new();
        let record = session("h1", "user-1", Duration::hours(1));
        store.create_session(&record).await.unwrap();

        let loaded = store.get_session("h1").await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let store = MemoryStore::new();
        let record = session("h1", "user-1", Duration::hours(1));
        store.create_session(&record).await.unwrap();

        let err = store.create_session(&record).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_counter_cas_conflict_leaves_record_unchanged() {
        let store = MemoryStore::new();
        let mut record = session("h1", "user-1", Duration::hours(1));
        store.create_session(&record).await.unwrap();

        record.lineage_counter = 1;
        record.refresh_token_hash = "cd".repeat(32);
        store.update_session_if_counter(&record, 0).await.unwrap();

        // Stale CAS: stored counter is now 1, expected 0.
        let mut stale = record.clone();
        stale.lineage_counter = 2;
        let err = store
            .update_session_if_counter(&stale, 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::CounterConflict {
                expected: 0,
                actual: 1
            }
        ));

        let stored = store.get_session("h1").await.unwrap().unwrap();
        assert_eq!(stored.lineage_counter, 1);
        assert_eq!(stored.refresh_token_hash, "cd".repeat(32));
    }

    #[tokio::test]
    async fn test_cas_on_missing_session() {
        let store = MemoryStore::new();
        let record = session("ghost", "user-1", Duration::hours(1));
        let err = store
            .update_session_if_counter(&record, 0)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_session_idempotent() {
        let store = MemoryStore::new();
        store
            .create_session(&session("h1", "user-1", Duration::hours(1)))
            .await
            .unwrap();

        assert!(store.delete_session("h1").await.unwrap());
        assert!(!store.delete_session("h1").await.unwrap());
    }

    #[tokio::test]
    async fn test_session_handles_for_user_scoped_by_tenant() {
        let store = MemoryStore::new();
        store
            .create_session(&session("h1", "user-1", Duration::hours(1)))
            .await
            .unwrap();
        store
            .create_session(&session("h2", "user-1", Duration::hours(1)))
            .await
            .unwrap();
        store
            .create_session(&session("h3", "user-2", Duration::hours(1)))
            .await
            .unwrap();

        let mut handles = store
            .session_handles_for_user(&TenantKey::base(), "user-1")
            .await
            .unwrap();
        handles.sort();
        assert_eq!(handles, vec!["h1", "h2"]);

        let other = store
            .session_handles_for_user(&TenantKey::new("", "", "acme"), "user-1")
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_delete_expired_sessions() {
        let store = MemoryStore::new();
        store
            .create_session(&session("live", "user-1", Duration::hours(1)))
            .await
            .unwrap();
        store
            .create_session(&session("dead", "user-1", Duration::hours(-1)))
            .await
            .unwrap();

        let deleted = store.delete_expired_sessions(now_utc()).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_session("live").await.unwrap().is_some());
        assert!(store.get_session("dead").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_signing_keys_sorted_newest_first() {
        let store = MemoryStore::new();
        let app = AppKey::base();
        let old = dynamic_key("old", Duration::hours(-2), Duration::hours(24));
        let new = dynamic_key("new", Duration::ZERO, Duration::hours(24));

        store
            .insert_signing_key_if_newest(&app, &old, None)
            .await
            .unwrap();
        store
            .insert_signing_key_if_newest(&app, &new, Some("old"))
            .await
            .unwrap();

        let keys = store.signing_keys(&app).await.unwrap();
        assert_eq!(keys[0].key_id, "new");
        assert_eq!(keys[1].key_id, "old");
    }

    #[tokio::test]
    async fn test_newest_key_guard_rejects_stale_view() {
        let store = MemoryStore::new();
        let app = AppKey::base();
        let first = dynamic_key("first", Duration::hours(-1), Duration::hours(24));
        store
            .insert_signing_key_if_newest(&app, &first, None)
            .await
            .unwrap();

        // A caller that still believes there are no keys loses the race.
        let second = dynamic_key("second", Duration::ZERO, Duration::hours(24));
        let err = store
            .insert_signing_key_if_newest(&app, &second, None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let keys = store.signing_keys(&app).await.unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_signing_keys_respects_keep() {
        let store = MemoryStore::new();
        let app = AppKey::base();
        let expired = dynamic_key("expired", Duration::hours(-48), Duration::hours(1));
        let protected = dynamic_key("protected", Duration::hours(-47), Duration::hours(1));
        store
            .insert_signing_key_if_newest(&app, &expired, None)
            .await
            .unwrap();
        store
            .insert_signing_key_if_newest(&app, &protected, Some("expired"))
            .await
            .unwrap();

        let deleted = store
            .delete_signing_keys(&app, now_utc(), Some("protected"))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let keys = store.signing_keys(&app).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_id, "protected");
    }

    #[tokio::test]
    async fn test_refresh_key_bootstrap_converges() {
        let store = MemoryStore::new();
        let app = AppKey::base();
        let now = now_utc();
        let mk = |id: &str| SigningKeyRecord {
            key_id: id.to_string(),
            algorithm: KeyAlgorithm::HS256,
            material: KeyMaterial::Hmac {
                secret: "c2VjcmV0".to_string(),
            },
            created_at: now,
            expires_at: None,
        };

        let first = store.put_refresh_key_if_absent(&app, &mk("a")).await.unwrap();
        let second = store.put_refresh_key_if_absent(&app, &mk("b")).await.unwrap();
        assert_eq!(first.key_id, "a");
        assert_eq!(second.key_id, "a");
    }

    #[tokio::test]
    async fn test_codes_take_once() {
        let store = MemoryStore::new();
        let now = now_utc();
        let code = ShortLivedCode {
            code_hash: "ef".repeat(32),
            tenant: TenantKey::base(),
            purpose: CodePurpose::Passwordless,
            payload: serde_json::json!({"email": "a@example.com"}),
            created_at: now,
            expires_at: now + Duration::minutes(15),
        };
        store.put_code(&code).await.unwrap();
        assert!(store.put_code(&code).await.unwrap_err().is_conflict());

        let taken = store
            .take_code(&TenantKey::base(), &code.code_hash)
            .await
            .unwrap();
        assert_eq!(taken, Some(code.clone()));

        let again = store
            .take_code(&TenantKey::base(), &code.code_hash)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_delete_expired_codes() {
        let store = MemoryStore::new();
        let now = now_utc();
        let expired = ShortLivedCode {
            code_hash: "aa".repeat(32),
            tenant: TenantKey::base(),
            purpose: CodePurpose::PasswordReset,
            payload: serde_json::json!({}),
            created_at: now - Duration::hours(1),
            expires_at: now - Duration::minutes(45),
        };
        store.put_code(&expired).await.unwrap();

        let deleted = store.delete_expired_codes(now).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let err = store.get_session("h1").await.unwrap_err();
        assert!(err.is_unavailable());
        let err = store
            .delete_expired_sessions(now_utc())
            .await
            .unwrap_err();
        assert!(err.is_unavailable());

        store.set_unavailable(false);
        assert!(store.get_session("h1").await.unwrap().is_none());
    }
}
