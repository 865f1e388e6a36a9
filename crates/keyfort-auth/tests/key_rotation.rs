//! Signing-key rotation driven through the maintenance surface, and the
//! token round-trip properties across rotations.

use std::sync::Arc;
use std::time::Duration;

use keyfort_auth::tasks::{EXPIRED_KEY_SWEEP, SIGNING_KEY_ROTATION};
use keyfort_auth::{AuthConfig, AuthCore, TenantConfigEntry};
use keyfort_core::{AppKey, TenantKey};
use keyfort_db_memory::MemoryStore;
use keyfort_storage::SessionStore;

/// Seconds-scale rendition of the rotation scenario: validity 3s standing in
/// for 24h, rotation threshold 2s for 1h.
fn short_lived_config() -> AuthConfig {
    let mut config = AuthConfig::default();
    config.access_token_lifetime = Duration::from_secs(2);
    config.refresh_token_lifetime = Duration::from_secs(60);
    config.clock_skew_tolerance = Duration::ZERO;
    config.signing.dynamic_key_validity = Duration::from_secs(3);
    config.signing.rotation_threshold = Duration::from_secs(2);
    config
}

async fn rotation_core() -> (AuthCore, Arc<MemoryStore>, TenantKey) {
    let core = AuthCore::new(short_lived_config()).unwrap();
    let store = Arc::new(MemoryStore::new());
    let tenant = TenantKey::base();
    core.apply_tenant_config(vec![TenantConfigEntry {
        tenant: tenant.clone(),
        storage: store.clone() as Arc<dyn SessionStore>,
    }])
    .await
    .unwrap();
    core.start_maintenance();
    (core, store, tenant)
}

#[tokio::test]
async fn test_rotation_does_not_orphan_live_tokens() {
    let (core, _store, tenant) = rotation_core().await;

    let created = core
        .create_session(&tenant, "user-1", serde_json::json!({}))
        .await
        .unwrap();
    let first_claims = core
        .validate_access_token(
            &tenant,
            &created.access_token.token,
            created.anti_csrf_token.as_deref(),
        )
        .await
        .unwrap();
    let first_kid = first_claims.signing_key_id.clone();

    // Fresh key: the rotation check is a no-op.
    let report = core.scheduler().run_once(SIGNING_KEY_ROTATION).await.unwrap();
    assert!(report.fully_succeeded());

    // Past the threshold the check generates a successor.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    core.scheduler().run_once(SIGNING_KEY_ROTATION).await.unwrap();

    // New sessions sign with the new key...
    let second = core
        .create_session(&tenant, "user-2", serde_json::json!({}))
        .await
        .unwrap();
    let second_claims = core
        .validate_access_token(
            &tenant,
            &second.access_token.token,
            second.anti_csrf_token.as_deref(),
        )
        .await
        .unwrap();
    assert_ne!(second_claims.signing_key_id, first_kid);

    // ...while the token signed before the rotation keeps verifying for as
    // long as it lives: the outgoing key stays verification-valid.
    let still_valid = core
        .validate_access_token(
            &tenant,
            &created.access_token.token,
            created.anti_csrf_token.as_deref(),
        )
        .await
        .unwrap();
    assert_eq!(still_valid.signing_key_id, first_kid);

    // Both keys are published while both are valid.
    let jwks = core.signing_key_set(&AppKey::base()).await.unwrap();
    let kids: Vec<&str> = jwks.keys.iter().map(|k| k.kid.as_str()).collect();
    assert!(kids.contains(&first_kid.as_str()));
    assert!(kids.contains(&second_claims.signing_key_id.as_str()));
}

#[tokio::test]
async fn test_retired_key_swept_only_after_safety_margin() {
    let (core, store, tenant) = rotation_core().await;

    let created = core
        .create_session(&tenant, "user-1", serde_json::json!({}))
        .await
        .unwrap();
    let first_kid = core
        .validate_access_token(
            &tenant,
            &created.access_token.token,
            created.anti_csrf_token.as_deref(),
        )
        .await
        .unwrap()
        .signing_key_id;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    core.scheduler().run_once(SIGNING_KEY_ROTATION).await.unwrap();

    // The old key expires at t=3s, but the sweep must keep it until the
    // cleanup margin (access lifetime) has also passed.
    tokio::time::sleep(Duration::from_millis(2000)).await; // t ~ 3.2s
    core.scheduler().run_once(EXPIRED_KEY_SWEEP).await.unwrap();
    let jwks_len_mid = core
        .signing_key_set(&AppKey::base())
        .await
        .unwrap()
        .keys
        .len();
    // The old key is no longer published (expired) but a token it signed
    // could still be in flight, so it must not have been deleted while any
    // such token could verify. Valid-key publication is down to one.
    assert_eq!(jwks_len_mid, 1);

    // The record itself is still in storage: a token it signed could still
    // be inside the clock-skew margin.
    let stored = store.signing_keys(&AppKey::base()).await.unwrap();
    assert!(stored.iter().any(|k| k.key_id == first_kid));

    // t ~ 5.3s: expiry (3s) + margin (2s) passed; the sweep may delete it.
    tokio::time::sleep(Duration::from_millis(2100)).await;
    let report = core.scheduler().run_once(EXPIRED_KEY_SWEEP).await.unwrap();
    assert!(report.fully_succeeded());

    let stored = store.signing_keys(&AppKey::base()).await.unwrap();
    assert!(stored.iter().all(|k| k.key_id != first_kid));
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn test_refresh_chain_survives_rotation() {
    let (core, _store, tenant) = rotation_core().await;

    let created = core
        .create_session(&tenant, "user-1", serde_json::json!({}))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    core.scheduler().run_once(SIGNING_KEY_ROTATION).await.unwrap();

    // The refresh token was issued before the rotation; refreshing re-signs
    // the access token with the current (new) key and must succeed.
    let refreshed = core
        .refresh_session(&tenant, &created.refresh_token.token)
        .await
        .unwrap();
    let claims = core
        .validate_access_token(
            &tenant,
            &refreshed.access_token.token,
            refreshed.anti_csrf_token.as_deref(),
        )
        .await
        .unwrap();
    assert_eq!(claims.user_id, "user-1");
}

#[tokio::test]
async fn test_expired_access_token_rejected() {
    let (core, _store, tenant) = rotation_core().await;
    let created = core
        .create_session(&tenant, "user-1", serde_json::json!({}))
        .await
        .unwrap();

    // Access lifetime is 2s with zero skew tolerance.
    tokio::time::sleep(Duration::from_millis(2300)).await;
    let err = core
        .validate_access_token(
            &tenant,
            &created.access_token.token,
            created.anti_csrf_token.as_deref(),
        )
        .await
        .unwrap_err();
    assert!(err.is_security_violation());
}
