//! The upward-facing session API.
//!
//! [`AuthCore`] is what a transport layer embeds: it owns the tenant
//! registry, the per-app key managers, and the maintenance scheduler, and
//! exposes the session operations as tenant-resolving wrappers. Every
//! operation returns an [`AuthResult`] value; nothing panics or throws past
//! this boundary.
//!
//! Tenant topology comes in declaratively through
//! [`AuthCore::apply_tenant_config`]: the embedding process calls it with
//! the full desired set whenever its tenant configuration source changes,
//! and the core adds, rebuilds, or tears down bundles to match.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::info;

use keyfort_core::{AppKey, TenantKey};
use keyfort_storage::SessionStore;

use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::jwt::Jwks;
use crate::keys::{KeyManagerSet, KeyPolicy};
use crate::registry::{ResourceBundle, TenantRegistry};
use crate::scheduler::Scheduler;
use crate::session::{SessionClaims, SessionInformationHolder, SessionManager};
use crate::tasks::{ExpiredCodeSweep, ExpiredKeySweep, ExpiredSessionSweep, SigningKeyRotation};

/// One row of the tenant configuration source: a tenant and the storage
/// backing it.
#[derive(Clone)]
pub struct TenantConfigEntry {
    /// The tenant.
    pub tenant: TenantKey,

    /// The storage instance serving it (tenants may share one).
    pub storage: Arc<dyn SessionStore>,
}

/// The session core.
pub struct AuthCore {
    config: Arc<AuthConfig>,
    registry: Arc<TenantRegistry>,
    keys: Arc<KeyManagerSet>,
    scheduler: Arc<Scheduler>,
}

impl AuthCore {
    /// Creates a core with a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] if the config violates its
    /// numeric policy.
    pub fn new(config: AuthConfig) -> AuthResult<Self> {
        config
            .validate()
            .map_err(|e| AuthError::configuration(e.to_string()))?;

        let registry = Arc::new(TenantRegistry::new());
        let keys = Arc::new(KeyManagerSet::new(KeyPolicy::from(&config)));
        let scheduler = Arc::new(Scheduler::new(registry.clone()));
        Ok(Self {
            config: Arc::new(config),
            registry,
            keys,
            scheduler,
        })
    }

    /// The effective configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<AuthConfig> {
        &self.config
    }

    /// The tenant registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    /// The maintenance scheduler (register-task / force-run / override
    /// control surface).
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Reconciles the registry against the desired tenant set.
    ///
    /// Missing tenants are added, vanished tenants are torn down (releasing
    /// their storage if unshared), and tenants whose storage instance
    /// changed are rebuilt. Key managers for apps that no longer have any
    /// tenant are dropped with their key caches.
    pub async fn apply_tenant_config(&self, entries: Vec<TenantConfigEntry>) -> AuthResult<()> {
        let desired: HashMap<TenantKey, Arc<dyn SessionStore>> = entries
            .into_iter()
            .map(|e| (e.tenant, e.storage))
            .collect();

        for existing in self.registry.list_tenants(None) {
            let keep = match desired.get(&existing) {
                Some(storage) => {
                    let bundle = self.registry.get(&existing)?;
                    Arc::ptr_eq(bundle.storage(), storage)
                }
                None => false,
            };
            if !keep {
                self.registry.remove(&existing).await;
                // Rebuilt below if still desired; the app's key manager is
                // dropped so it re-binds to the new storage.
                self.keys.remove(&existing.app_key());
            }
        }

        for (tenant, storage) in desired {
            let config = self.config.clone();
            let bundle_tenant = tenant.clone();
            self.registry.set(tenant, move || {
                Ok(ResourceBundle::new(bundle_tenant, storage, config))
            })?;
        }

        let live: HashSet<AppKey> = self.registry.list_apps().into_iter().collect();
        self.keys.retain_apps(&live);

        info!(tenants = self.registry.len(), "applied tenant configuration");
        Ok(())
    }

    /// Registers the shipped maintenance tasks and starts their loops.
    pub fn start_maintenance(&self) {
        self.scheduler
            .register(ExpiredSessionSweep::spec(), Arc::new(ExpiredSessionSweep));
        self.scheduler
            .register(ExpiredCodeSweep::spec(), Arc::new(ExpiredCodeSweep));
        self.scheduler.register(
            SigningKeyRotation::spec(),
            Arc::new(SigningKeyRotation::new(
                self.registry.clone(),
                self.keys.clone(),
            )),
        );
        self.scheduler.register(
            ExpiredKeySweep::spec(),
            Arc::new(ExpiredKeySweep::new(
                self.registry.clone(),
                self.keys.clone(),
            )),
        );
    }

    /// Stops the maintenance loops.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    fn session_manager(&self, tenant: &TenantKey) -> AuthResult<SessionManager> {
        let bundle = self.registry.get(tenant)?;
        let manager = self
            .keys
            .get_or_create(&tenant.app_key(), bundle.storage().clone());
        Ok(SessionManager::new(
            tenant.clone(),
            bundle.storage().clone(),
            manager,
            bundle.config().clone(),
        ))
    }

    /// Creates a session for a user of a tenant.
    pub async fn create_session(
        &self,
        tenant: &TenantKey,
        user_id: &str,
        user_data: serde_json::Value,
    ) -> AuthResult<SessionInformationHolder> {
        self.session_manager(tenant)?
            .create_session(user_id, user_data)
            .await
    }

    /// Refreshes a session with a presented refresh token.
    pub async fn refresh_session(
        &self,
        tenant: &TenantKey,
        refresh_token: &str,
    ) -> AuthResult<SessionInformationHolder> {
        self.session_manager(tenant)?
            .refresh_session(refresh_token)
            .await
    }

    /// Verifies an access token and returns its claims.
    pub async fn validate_access_token(
        &self,
        tenant: &TenantKey,
        access_token: &str,
        anti_csrf: Option<&str>,
    ) -> AuthResult<SessionClaims> {
        self.session_manager(tenant)?
            .validate_access_token(access_token, anti_csrf)
            .await
    }

    /// Revokes a session; idempotent.
    pub async fn revoke_session(&self, tenant: &TenantKey, handle: &str) -> AuthResult<bool> {
        self.session_manager(tenant)?.revoke_session(handle).await
    }

    /// Revokes every session of a user within a tenant.
    pub async fn revoke_all_for_user(
        &self,
        tenant: &TenantKey,
        user_id: &str,
    ) -> AuthResult<u64> {
        self.session_manager(tenant)?
            .revoke_all_for_user(user_id)
            .await
    }

    /// Returns the JWK set of an app's valid signing keys, for external
    /// publication.
    pub async fn signing_key_set(&self, app: &AppKey) -> AuthResult<Jwks> {
        let storage = self
            .registry
            .storage_for_app(app)
            .ok_or_else(|| AuthError::tenant_not_found(app))?;
        self.keys.get_or_create(app, storage).jwks().await
    }
}
