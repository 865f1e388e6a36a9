//! Signing key management.
//!
//! One [`SigningKeyManager`] exists per app (all tenants under an app share
//! signing keys, so tokens verify across tenant aliases). The manager owns:
//!
//! - the *dynamic* RS256 keys that sign access tokens: generated on first
//!   use, rotated before they run out of validity, kept verification-valid
//!   until their own expiry, and swept from storage only once every token
//!   they could have signed has expired;
//! - the *static* HS256 refresh key that signs refresh tokens: created once
//!   per app, never rotated, never swept.
//!
//! Keys live in storage; the manager keeps a lock-free cache (`arc-swap`)
//! that is reloaded whenever a caller's view turns out to be stale — an
//! unknown `kid`, no valid key, or a lost insert race. Inserts go through
//! the storage port's optimistic guards rather than an in-process lock,
//! because several processes may share one backend.

use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use keyfort_core::{AppKey, now_utc};
use keyfort_storage::{KeyAlgorithm, SessionStore, SigningKeyRecord};

use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::jwt::{
    Jwks, JwtError, SessionKeyPair, generate_hmac_material, generate_rsa_material,
};

/// Bounded retries for the bootstrap/rotation insert race.
const MAX_CONVERGE_ATTEMPTS: usize = 3;

/// Key validity and rotation policy, derived from [`AuthConfig`].
#[derive(Debug, Clone)]
pub struct KeyPolicy {
    /// Verification validity of a dynamic key from its creation.
    pub dynamic_key_validity: std::time::Duration,

    /// Remaining-validity threshold below which rotation generates a
    /// successor.
    pub rotation_threshold: std::time::Duration,

    /// How long an expired key is kept in storage before the sweep may
    /// delete it.
    pub cleanup_margin: std::time::Duration,
}

impl From<&AuthConfig> for KeyPolicy {
    fn from(config: &AuthConfig) -> Self {
        Self {
            dynamic_key_validity: config.signing.dynamic_key_validity,
            rotation_threshold: config.signing.rotation_threshold,
            cleanup_margin: config.key_cleanup_margin(),
        }
    }
}

/// A signing key loaded into memory: the persisted record plus the parsed
/// encode/decode handles.
pub struct SessionKey {
    /// The persisted record.
    pub record: SigningKeyRecord,

    /// Parsed key handles.
    pub pair: SessionKeyPair,
}

impl SessionKey {
    fn from_record(record: SigningKeyRecord) -> AuthResult<Arc<Self>> {
        let pair =
            SessionKeyPair::from_material(&record.key_id, record.algorithm, &record.material)
                .map_err(key_error)?;
        Ok(Arc::new(Self { record, pair }))
    }

    /// The key id.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.record.key_id
    }

    /// Returns `true` if this key is valid for verification at `now`.
    #[must_use]
    pub fn is_valid(&self, now: OffsetDateTime) -> bool {
        self.record.is_valid(now)
    }
}

fn key_error(e: JwtError) -> AuthError {
    AuthError::internal(format!("signing key error: {e}"))
}

fn to_time(d: std::time::Duration) -> time::Duration {
    time::Duration::try_from(d).unwrap_or(time::Duration::MAX)
}

/// Per-app signing key manager.
pub struct SigningKeyManager {
    app: AppKey,
    storage: Arc<dyn SessionStore>,
    policy: KeyPolicy,

    /// All dynamic keys known to this process, newest first (including
    /// expired ones — the newest-overall id is the optimistic insert guard).
    dynamic: ArcSwap<Vec<Arc<SessionKey>>>,

    /// The static refresh key, once loaded.
    refresh: ArcSwapOption<SessionKey>,

    /// Serializes cache reloads within this process.
    reload_lock: Mutex<()>,
}

impl SigningKeyManager {
    /// Creates a manager for one app over its storage handle.
    #[must_use]
    pub fn new(app: AppKey, storage: Arc<dyn SessionStore>, policy: KeyPolicy) -> Self {
        Self {
            app,
            storage,
            policy,
            dynamic: ArcSwap::from_pointee(Vec::new()),
            refresh: ArcSwapOption::from(None),
            reload_lock: Mutex::new(()),
        }
    }

    /// The app this manager is scoped to.
    #[must_use]
    pub fn app(&self) -> &AppKey {
        &self.app
    }

    /// Reloads the dynamic key cache from storage.
    async fn reload(&self) -> AuthResult<Arc<Vec<Arc<SessionKey>>>> {
        let _guard = self.reload_lock.lock().await;
        let records = self.storage.signing_keys(&self.app).await?;
        let mut keys = records
            .into_iter()
            .map(SessionKey::from_record)
            .collect::<AuthResult<Vec<_>>>()?;
        keys.sort_by(|a, b| b.record.created_at.cmp(&a.record.created_at));

        let keys = Arc::new(keys);
        self.dynamic.store(keys.clone());
        debug!(app = %self.app, keys = keys.len(), "reloaded signing key cache");
        Ok(keys)
    }

    fn newest_cached_id(&self) -> Option<String> {
        self.dynamic
            .load()
            .first()
            .map(|k| k.record.key_id.clone())
    }

    fn valid_from(keys: &[Arc<SessionKey>], now: OffsetDateTime) -> Vec<Arc<SessionKey>> {
        keys.iter().filter(|k| k.is_valid(now)).cloned().collect()
    }

    /// Returns all keys valid for verification, newest first.
    ///
    /// Reloads from storage when the cached view holds no valid key, so
    /// keys minted by other processes are picked up. The result may still
    /// be empty (pre-bootstrap).
    pub async fn all_valid_keys(&self) -> AuthResult<Vec<Arc<SessionKey>>> {
        let now = now_utc();
        let cached = Self::valid_from(&self.dynamic.load(), now);
        if !cached.is_empty() {
            return Ok(cached);
        }
        let reloaded = self.reload().await?;
        Ok(Self::valid_from(&reloaded, now))
    }

    /// Returns the current signing key: the newest key still valid for
    /// verification, generating one if none exists (first-use bootstrap).
    ///
    /// Concurrent bootstraps — in this process or another sharing the same
    /// storage — converge on a single key via the storage-level newest-key
    /// guard: the loser reloads and adopts the winner's key.
    pub async fn current_signing_key(&self) -> AuthResult<Arc<SessionKey>> {
        for _ in 0..MAX_CONVERGE_ATTEMPTS {
            if let Some(key) = self.all_valid_keys().await?.into_iter().next() {
                return Ok(key);
            }

            let record = self.generate_dynamic_record()?;
            let expected = self.newest_cached_id();
            match self
                .storage
                .insert_signing_key_if_newest(&self.app, &record, expected.as_deref())
                .await
            {
                Ok(()) => {
                    info!(app = %self.app, kid = %record.key_id, "generated signing key");
                    self.reload().await?;
                }
                Err(e) if e.is_conflict() => {
                    debug!(app = %self.app, "lost signing key insert race, reloading");
                    self.reload().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AuthError::internal(
            "signing key bootstrap did not converge",
        ))
    }

    /// Looks a verification key up by id, reloading once on a cache miss.
    pub async fn key_by_id(&self, kid: &str) -> AuthResult<Option<Arc<SessionKey>>> {
        let now = now_utc();
        let find = |keys: &[Arc<SessionKey>]| {
            keys.iter()
                .find(|k| k.record.key_id == kid && k.is_valid(now))
                .cloned()
        };

        if let Some(key) = find(&self.dynamic.load()) {
            return Ok(Some(key));
        }
        let reloaded = self.reload().await?;
        Ok(find(&reloaded))
    }

    /// Returns the app's static refresh key, creating it on first use.
    ///
    /// Concurrent bootstraps converge on whichever key the storage kept.
    pub async fn refresh_signing_key(&self) -> AuthResult<Arc<SessionKey>> {
        if let Some(key) = self.refresh.load_full() {
            return Ok(key);
        }

        let _guard = self.reload_lock.lock().await;
        if let Some(key) = self.refresh.load_full() {
            return Ok(key);
        }

        let record = match self.storage.refresh_key(&self.app).await? {
            Some(record) => record,
            None => {
                let candidate = SigningKeyRecord {
                    key_id: Uuid::new_v4().to_string(),
                    algorithm: KeyAlgorithm::HS256,
                    material: generate_hmac_material(),
                    created_at: now_utc(),
                    expires_at: None,
                };
                let stored = self
                    .storage
                    .put_refresh_key_if_absent(&self.app, &candidate)
                    .await?;
                if stored.key_id == candidate.key_id {
                    info!(app = %self.app, kid = %stored.key_id, "generated refresh key");
                }
                stored
            }
        };

        let key = SessionKey::from_record(record)?;
        self.refresh.store(Some(key.clone()));
        Ok(key)
    }

    /// Generates a successor key when the current key's remaining validity
    /// has dropped below the rotation threshold.
    ///
    /// The outgoing key is not touched: it stays verification-valid until
    /// its own expiry, so tokens it signed keep verifying (zero-downtime
    /// rotation). Returns `true` if this call generated a key.
    pub async fn rotate_if_needed(&self) -> AuthResult<bool> {
        let now = now_utc();
        let valid = self.all_valid_keys().await?;
        let Some(current) = valid.first() else {
            // Nothing to rotate from; bootstrap instead.
            self.current_signing_key().await?;
            return Ok(true);
        };

        let Some(expires_at) = current.record.expires_at else {
            return Ok(false);
        };
        if expires_at - now > to_time(self.policy.rotation_threshold) {
            return Ok(false);
        }

        let record = self.generate_dynamic_record()?;
        let expected = self.newest_cached_id();
        match self
            .storage
            .insert_signing_key_if_newest(&self.app, &record, expected.as_deref())
            .await
        {
            Ok(()) => {
                info!(
                    app = %self.app,
                    old_kid = %current.record.key_id,
                    new_kid = %record.key_id,
                    "rotated signing key"
                );
                self.reload().await?;
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(app = %self.app, "concurrent rotation won the insert race");
                self.reload().await?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes dynamic keys whose expiry lies further in the past than the
    /// cleanup margin. The newest key is always excluded, even if a
    /// misconfigured expiry would make it eligible.
    ///
    /// Returns the number of keys deleted.
    pub async fn clean_expired_keys(&self) -> AuthResult<u64> {
        if self.dynamic.load().is_empty() {
            self.reload().await?;
        }
        let keep = self.newest_cached_id();
        let cutoff = now_utc() - to_time(self.policy.cleanup_margin);

        let deleted = self
            .storage
            .delete_signing_keys(&self.app, cutoff, keep.as_deref())
            .await?;
        if deleted > 0 {
            info!(app = %self.app, deleted, "swept expired signing keys");
            self.reload().await?;
        }
        Ok(deleted)
    }

    /// Exports all valid asymmetric keys as a JWK set.
    pub async fn jwks(&self) -> AuthResult<Jwks> {
        let mut jwks = Jwks::new();
        for key in self.all_valid_keys().await? {
            if let Some(jwk) = key.pair.to_jwk() {
                jwks.add_key(jwk);
            }
        }
        Ok(jwks)
    }

    fn generate_dynamic_record(&self) -> AuthResult<SigningKeyRecord> {
        let material = generate_rsa_material().map_err(key_error)?;
        let now = now_utc();
        Ok(SigningKeyRecord {
            key_id: Uuid::new_v4().to_string(),
            algorithm: KeyAlgorithm::RS256,
            material,
            created_at: now,
            expires_at: Some(now + self.policy.dynamic_key_validity),
        })
    }
}

/// Process-wide map of per-app key managers.
pub struct KeyManagerSet {
    policy: KeyPolicy,
    managers: DashMap<AppKey, Arc<SigningKeyManager>>,
}

impl KeyManagerSet {
    /// Creates an empty set with the given policy.
    #[must_use]
    pub fn new(policy: KeyPolicy) -> Self {
        Self {
            policy,
            managers: DashMap::new(),
        }
    }

    /// Returns the manager for an app, creating it over `storage` on first
    /// access.
    #[must_use]
    pub fn get_or_create(
        &self,
        app: &AppKey,
        storage: Arc<dyn SessionStore>,
    ) -> Arc<SigningKeyManager> {
        self.managers
            .entry(app.clone())
            .or_insert_with(|| {
                Arc::new(SigningKeyManager::new(
                    app.clone(),
                    storage,
                    self.policy.clone(),
                ))
            })
            .clone()
    }

    /// Drops the manager for an app (its key cache with it).
    pub fn remove(&self, app: &AppKey) {
        self.managers.remove(app);
    }

    /// Drops managers for every app not present in `live`.
    pub fn retain_apps(&self, live: &std::collections::HashSet<AppKey>) {
        self.managers.retain(|app, _| live.contains(app));
    }

    /// Snapshot of the apps with a live manager.
    #[must_use]
    pub fn apps(&self) -> Vec<AppKey> {
        self.managers.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyfort_db_memory::MemoryStore;
    use std::time::Duration;

    fn policy(validity: Duration, threshold: Duration) -> KeyPolicy {
        KeyPolicy {
            dynamic_key_validity: validity,
            rotation_threshold: threshold,
            cleanup_margin: Duration::from_millis(100),
        }
    }

    fn manager_over(storage: Arc<dyn SessionStore>, p: KeyPolicy) -> SigningKeyManager {
        SigningKeyManager::new(AppKey::base(), storage, p)
    }

    #[tokio::test]
    async fn test_bootstrap_generates_single_key() {
        let storage: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let manager = manager_over(
            storage.clone(),
            policy(Duration::from_secs(3600), Duration::from_secs(60)),
        );

        let key = manager.current_signing_key().await.unwrap();
        let again = manager.current_signing_key().await.unwrap();
        assert_eq!(key.kid(), again.kid());

        let stored = storage.signing_keys(&AppKey::base()).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_bootstrap_converges() {
        // Two managers over the same storage model two processes sharing a
        // backend; both bootstrap, exactly one key wins.
        let storage: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let p = policy(Duration::from_secs(3600), Duration::from_secs(60));
        let a = manager_over(storage.clone(), p.clone());
        let b = manager_over(storage.clone(), p);

        let (ka, kb) = tokio::join!(a.current_signing_key(), b.current_signing_key());
        assert_eq!(ka.unwrap().kid(), kb.unwrap().kid());

        let stored = storage.signing_keys(&AppKey::base()).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_rotation_keeps_old_key_valid() {
        let storage: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        // 2s validity, rotate when less than 1.5s remain.
        let manager = manager_over(
            storage.clone(),
            policy(Duration::from_secs(2), Duration::from_millis(1500)),
        );

        let first = manager.current_signing_key().await.unwrap();
        assert!(!manager.rotate_if_needed().await.unwrap());

        tokio::time::sleep(Duration::from_millis(700)).await;
        let rotated = manager.rotate_if_needed().await.unwrap();
        assert!(rotated);

        let current = manager.current_signing_key().await.unwrap();
        assert_ne!(current.kid(), first.kid());

        // The outgoing key is still valid for verification.
        let valid = manager.all_valid_keys().await.unwrap();
        assert!(valid.iter().any(|k| k.kid() == first.kid()));
        assert!(valid.iter().any(|k| k.kid() == current.kid()));
    }

    #[tokio::test]
    async fn test_rotation_not_needed_with_fresh_key() {
        let storage: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let manager = manager_over(
            storage.clone(),
            policy(Duration::from_secs(3600), Duration::from_secs(60)),
        );
        manager.current_signing_key().await.unwrap();
        assert!(!manager.rotate_if_needed().await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_protects_newest_key() {
        let storage: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        // Keys expire almost immediately and the margin is tiny, so the
        // sweep would take everything were the newest not protected.
        let manager = manager_over(
            storage.clone(),
            policy(Duration::from_millis(50), Duration::from_millis(10)),
        );
        let key = manager.current_signing_key().await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let deleted = manager.clean_expired_keys().await.unwrap();
        assert_eq!(deleted, 0);

        let stored = storage.signing_keys(&AppKey::base()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].key_id, key.kid());
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_retired_keys() {
        let storage: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let manager = manager_over(
            storage.clone(),
            policy(Duration::from_millis(200), Duration::from_millis(150)),
        );
        let first = manager.current_signing_key().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.rotate_if_needed().await.unwrap());

        // Wait until the first key is expired past the cleanup margin.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let deleted = manager.clean_expired_keys().await.unwrap();
        assert_eq!(deleted, 1);

        let stored = storage.signing_keys(&AppKey::base()).await.unwrap();
        assert!(stored.iter().all(|k| k.key_id != first.kid()));
    }

    #[tokio::test]
    async fn test_refresh_key_converges_across_managers() {
        let storage: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let p = policy(Duration::from_secs(3600), Duration::from_secs(60));
        let a = manager_over(storage.clone(), p.clone());
        let b = manager_over(storage.clone(), p);

        let (ka, kb) = tokio::join!(a.refresh_signing_key(), b.refresh_signing_key());
        assert_eq!(ka.unwrap().kid(), kb.unwrap().kid());
    }

    #[tokio::test]
    async fn test_key_by_id_reloads_on_miss() {
        let storage: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let p = policy(Duration::from_secs(3600), Duration::from_secs(60));
        let minter = manager_over(storage.clone(), p.clone());
        let verifier = manager_over(storage.clone(), p);

        // Key minted by a different manager ("another process").
        let key = minter.current_signing_key().await.unwrap();

        let found = verifier.key_by_id(key.kid()).await.unwrap();
        assert!(found.is_some());
        assert!(verifier.key_by_id("no-such-kid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_jwks_exports_only_asymmetric_keys() {
        let storage: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let manager = manager_over(
            storage.clone(),
            policy(Duration::from_secs(3600), Duration::from_secs(60)),
        );
        let key = manager.current_signing_key().await.unwrap();
        manager.refresh_signing_key().await.unwrap();

        let jwks = manager.jwks().await.unwrap();
        assert_eq!(jwks.keys.len(), 1);
        assert_eq!(jwks.keys[0].kid, key.kid());
    }

    #[tokio::test]
    async fn test_key_manager_set_reuses_managers() {
        let storage: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let set = KeyManagerSet::new(policy(
            Duration::from_secs(3600),
            Duration::from_secs(60),
        ));

        let a = set.get_or_create(&AppKey::base(), storage.clone());
        let b = set.get_or_create(&AppKey::base(), storage.clone());
        assert!(Arc::ptr_eq(&a, &b));

        set.remove(&AppKey::base());
        assert!(set.apps().is_empty());
    }
}
